#[tokio::main]
async fn main() {
    relayd::init_tracing();
    if let Err(err) = relayd::run().await {
        eprintln!("relayd error: {err}");
        std::process::exit(err.exit_code());
    }
}
