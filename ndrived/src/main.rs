use ndrived::commands::{self, Command, USAGE};
use ndrived::config::Config;
use ndrived::logging;
use ndrived::manager::Manager;

async fn run(command: Command) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    if let Some(path) = logging::init(
        Some(&config.logs_dir()),
        &config.log_level,
        config.log_files_kept,
    ) {
        tracing::debug!(path = %path.display(), "logging to file");
    }
    let manager = Manager::open(config).await?;
    commands::run(manager, command).await
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let result = match commands::parse_command(std::env::args()) {
        Ok(Command::Help) => {
            println!("{USAGE}");
            return;
        }
        Ok(command) => run(command).await,
        Err(err) => {
            eprintln!("{USAGE}\n");
            Err(err)
        }
    };
    if let Err(err) = &result {
        eprintln!("ndrived: {err:#}");
    }
    std::process::exit(commands::exit_code(&result));
}
