/// Aurora ID - identity provider and OAuth2 server
use aurora_id::{server, AppContext, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first so the log format can follow it
    let config = ServerConfig::from_env()?;
    init_tracing(config.logging.json);

    print_banner(&config.service.version);

    let ctx = AppContext::new(config).await?;

    // Deliver anything that came due while we were down, then arm the timer
    ctx.start().await?;

    let result = server::serve(ctx.clone()).await;
    ctx.shutdown();
    result?;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "aurora_id=debug,tower_http=debug".into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_banner(version: &str) {
    println!(
        r#"
    ___                              ________
   /   | __  ___________  _________ /  _/ __ \
  / /| |/ / / / ___/ __ \/ ___/ __ `// // / / /
 / ___ / /_/ / /  / /_/ / /  / /_/ // // /_/ /
/_/  |_\__,_/_/   \____/_/   \__,_/___/_____/

        Identity Provider & OAuth2 Server v{}
        "#,
        version
    );
}
