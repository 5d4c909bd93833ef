#[tokio::main]
async fn main() {
    v3kn::server::run().await;
}
