use anyhow::Result;
use zfs_fixtures_cli::{Cli, Commands, Parser};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.global.init_tracing();

    match cli.command {
        Commands::Check(args) => args.run(&cli.global),
        Commands::Provision(args) => args.run(&cli.global).await,
        Commands::Run(args) => {
            let code = args.run(&cli.global).await?;
            std::process::exit(code)
        }
        Commands::Audit(args) => args.run(&cli.global).await,
    }
}
