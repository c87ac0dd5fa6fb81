#[tokio::main]
async fn main() -> Result<(), market_sync_lib::AppError> {
    market_sync_lib::run().await
}
