use userhub::builder::Builder;
use userhub::server::Server;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features. This also installs the user service along
    // with its cache, rate limiter, coalescer and background maintenance...
    let platform = Builder::new().enable_all().build().await;

    platform.require::<Server>().event_loop().await;
}
