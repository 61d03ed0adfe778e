use feature_flags::{feature_flag, ClientConfig, Variant};

pub fn main() -> feature_flags::Result<()> {
    env_logger::init();

    let base_url = std::env::var("FEATURE_FLAG_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_owned());
    let core = feature_flags::initialize(ClientConfig::new(base_url))?;
    let client = core.sync_client();

    // Simple flag check. Falls back to `false` if the service is unavailable.
    if client.is_enabled("new-ui", false) {
        println!("new UI is enabled");
    }

    // Flag with config.
    let rate_limit = client.get_feature("rate-limit", true);
    println!(
        "rate limit: enabled={}, limit={}",
        rate_limit.enabled,
        rate_limit.config_i64("limit").unwrap_or(100)
    );

    // Strict check: the caller decides what a failure means.
    match client.check_flag("risky-feature") {
        Ok(enabled) => println!("risky-feature: {enabled}"),
        Err(err) => println!("risky-feature could not be evaluated: {err}"),
    }

    // Experiment assignment.
    for user_id in ["user-1", "user-2", "user-3"] {
        let experiment = client.get_experiment("checkout-flow", user_id, Variant::Control);
        println!(
            "{user_id}: variant={}, discount={}",
            experiment.variant,
            experiment.payload_f64("discount").unwrap_or(0.0)
        );
    }

    // Gated function.
    let greet = feature_flag(client.clone(), "new-greeting", false, "Hello".to_owned())
        .wrap(|name: &str| format!("Howdy, {name}"));
    println!("{}", greet.call("Ferris"));

    client.with_experiment("checkout-flow", "user-1", Variant::Control, |ctx| {
        println!("{} is in {} of {}", ctx.subject_id(), ctx.variant, ctx.key());
    });

    feature_flags::cleanup();
    Ok(())
}
