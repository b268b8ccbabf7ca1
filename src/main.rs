use milmove_loadtest::milmove;
use milmove_loadtest::prelude::*;

#[tokio::main]
async fn main() -> Result<(), LoadTestError> {
    LoadTest::initialize()?
        .register_scenario(milmove::anonymous_scenario()?)
        .register_scenario(milmove::authenticated_scenario()?)
        .execute()
        .await?;

    Ok(())
}
