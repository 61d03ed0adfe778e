use std::time::Duration;

use feature_flags::{experiment_variant, AsyncClient, Variant};

async fn checkout_page(client: &AsyncClient, user_id: &str) -> String {
    let context = client
        .experiment_context("checkout-flow", user_id, Variant::Control)
        .await;
    match context.variant {
        Variant::Treatment => format!(
            "single-page checkout, layout={}",
            context.payload_str("layout").unwrap_or("default")
        ),
        _ => "classic checkout".to_owned(),
    }
}

#[tokio::main]
async fn main() -> feature_flags::Result<()> {
    env_logger::init();

    // Reads FEATURE_FLAG_BASE_URL and friends.
    let core = feature_flags::initialize_from_env()?;
    let client = core.async_client().with_timeout(Duration::from_millis(500));

    // Concurrent requests for the same flag share one fetch.
    let requests: Vec<_> = (0..10)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let page = checkout_page(&client, &format!("user-{i}")).await;
                let new_ui = client.is_enabled("new-ui", false).await;
                format!("user-{i}: {page}, new_ui={new_ui}")
            })
        })
        .collect();
    for request in requests {
        match request.await {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("request failed: {err}"),
        }
    }

    let pricing = experiment_variant(client.clone(), "pricing-test", Variant::Control).wrap(
        |user_id: &String| user_id.clone(),
        |user_id: String, variant: Variant| async move {
            format!("{user_id} sees {variant} pricing")
        },
    );
    println!("{}", pricing.call("user-42".to_owned()).await);

    feature_flags::cleanup();
    Ok(())
}
