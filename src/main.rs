mod app;

use chatsync::Settings;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load();
    if let Err(e) = app::run(settings).await {
        eprintln!("chatsync: {}", e);
        std::process::exit(1);
    }
}
