#[tokio::main]
async fn main() {
    if let Err(err) = codex_bridge::cli::run().await {
        tracing::error!(error = %err, "codex-bridge failed");
        std::process::exit(1);
    }
}
