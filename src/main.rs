#[tokio::main]
async fn main() -> anyhow::Result<()> {
    msr_relay_lib::run().await
}
