//! Drydock backend plugin that keeps workspace state on the local filesystem
//!
//! Drydock launches this binary itself; it is configured with a `path`
//! setting naming the directory to store state in.

mod store;

use store::FsPlugin;

#[tokio::main]
async fn main() {
    // stdout carries the protocol, so logs go to stderr only
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let plugin = FsPlugin::new();
    if let Err(e) = drydock_state::plugin::serve(&plugin).await {
        eprintln!("drydock-plugin-fs: {}", e);
        std::process::exit(1);
    }
}
