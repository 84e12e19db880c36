#[tokio::main]
async fn main() -> anyhow::Result<()> {
    habit_rollover::run(std::env::args().skip(1).collect()).await?;
    Ok(())
}
