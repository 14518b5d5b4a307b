//! htraced daemon entry point.

use htraced::cli::{self, Cli};
use htraced::core::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    cli::execute(cli).await
}
