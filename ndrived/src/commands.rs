use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use crate::deeplink::{DeepLink, DeepLinkError};
use crate::events::EngineEvent;
use crate::manager::{BindRequest, DispatchOutcome, Manager, ManagerError};

pub const USAGE: &str = "\
Usage: ndrived <command> [options]

Commands:
  bind-server --local-folder <dir> --url <server> --user <name>
              [--password <secret> | --token <token>] [--name <label>]
              [--remote-root <ref>] [--start]
  unbind-server --local-folder <dir>
  bind-root --local-folder <dir> <remote path>
  unbind-root --local-folder <dir> <remote path>
  clean-folder --local-folder <dir>
  config <key> <value>
  status
  console
  direct-edit <nxdrive:// link>

The server URL may end with #<ENGINE_TYPE> to pick another engine.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    BindServer(BindRequest),
    UnbindServer { folder: PathBuf },
    BindRoot { folder: PathBuf, remote_path: String },
    UnbindRoot { folder: PathBuf, remote_path: String },
    CleanFolder { folder: PathBuf },
    SetConfig { key: String, value: String },
    Status,
    Console,
    DeepLink(DeepLink),
    Help,
}

/// Parses `argv`, program name included.
pub fn parse_command<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(name) = args.next() else {
        return Ok(Command::Console);
    };
    let mut flags = Flags::collect(args)?;
    let command = match name.as_str() {
        "--help" | "-h" | "help" => Command::Help,
        "bind-server" => Command::BindServer(BindRequest {
            local_folder: flags.folder()?,
            server_url: flags.required("url")?,
            user: flags.required("user")?,
            password: flags.take("password"),
            token: flags.take("token"),
            name: flags.take("name"),
            remote_root: flags.take("remote-root"),
            start: flags.switch("start"),
        }),
        "unbind-server" => Command::UnbindServer {
            folder: flags.folder()?,
        },
        "bind-root" => Command::BindRoot {
            folder: flags.folder()?,
            remote_path: flags.positional("remote path")?,
        },
        "unbind-root" => Command::UnbindRoot {
            folder: flags.folder()?,
            remote_path: flags.positional("remote path")?,
        },
        "clean-folder" => Command::CleanFolder {
            folder: flags.folder()?,
        },
        "config" => Command::SetConfig {
            key: flags.positional("key")?,
            value: flags.positional("value")?,
        },
        "status" => Command::Status,
        "console" => Command::Console,
        "direct-edit" => {
            let link = flags.positional("link")?;
            Command::DeepLink(link.parse().with_context(|| format!("cannot parse {link}"))?)
        }
        other => anyhow::bail!("unknown command: {other}"),
    };
    flags.finish()?;
    Ok(command)
}

/// `--key value` pairs, bare `--switch`es and positionals in order.
struct Flags {
    named: Vec<(String, Option<String>)>,
    positionals: std::collections::VecDeque<String>,
}

const SWITCHES: &[&str] = &["start"];

impl Flags {
    fn collect(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut named = Vec::new();
        let mut positionals = std::collections::VecDeque::new();
        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            let Some(key) = arg.strip_prefix("--") else {
                positionals.push_back(arg);
                continue;
            };
            if let Some((key, value)) = key.split_once('=') {
                named.push((key.to_string(), Some(value.to_string())));
            } else if SWITCHES.contains(&key) {
                named.push((key.to_string(), None));
            } else {
                let value = args
                    .next()
                    .with_context(|| format!("--{key} expects a value"))?;
                named.push((key.to_string(), Some(value)));
            }
        }
        Ok(Self { named, positionals })
    }

    fn take(&mut self, key: &str) -> Option<String> {
        let at = self.named.iter().position(|(name, _)| name == key)?;
        self.named.remove(at).1
    }

    fn required(&mut self, key: &str) -> anyhow::Result<String> {
        self.take(key).with_context(|| format!("--{key} is required"))
    }

    fn switch(&mut self, key: &str) -> bool {
        match self.named.iter().position(|(name, _)| name == key) {
            Some(at) => {
                self.named.remove(at);
                true
            }
            None => false,
        }
    }

    fn folder(&mut self) -> anyhow::Result<PathBuf> {
        self.required("local-folder").map(PathBuf::from)
    }

    fn positional(&mut self, what: &str) -> anyhow::Result<String> {
        self.positionals
            .pop_front()
            .with_context(|| format!("missing {what}"))
    }

    fn finish(self) -> anyhow::Result<()> {
        if let Some((key, _)) = self.named.first() {
            anyhow::bail!("unknown option: --{key}");
        }
        if let Some(extra) = self.positionals.front() {
            anyhow::bail!("unexpected argument: {extra}");
        }
        Ok(())
    }
}

/// 0 on success, 1 when the request itself was wrong, 2 for anything else.
pub fn exit_code(result: &anyhow::Result<()>) -> i32 {
    let Err(err) = result else {
        return 0;
    };
    let domain = err.chain().any(|cause| {
        cause
            .downcast_ref::<ManagerError>()
            .is_some_and(ManagerError::is_domain)
            || cause.downcast_ref::<DeepLinkError>().is_some()
    });
    if domain { 1 } else { 2 }
}

pub async fn run(manager: Arc<Manager>, command: Command) -> anyhow::Result<()> {
    let result = execute(&manager, command).await;
    manager.close().await;
    result
}

async fn execute(manager: &Arc<Manager>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Help => println!("{USAGE}"),
        Command::BindServer(request) => {
            let start = request.start;
            let folder = request.local_folder.clone();
            let engine = manager
                .bind_server(request)
                .await
                .with_context(|| format!("cannot bind {}", folder.display()))?;
            println!("{} bound as engine {}", folder.display(), engine.uid());
            if start {
                console(manager).await?;
            }
        }
        Command::UnbindServer { folder } => {
            manager
                .unbind_server(&folder)
                .await
                .with_context(|| format!("cannot unbind {}", folder.display()))?;
            println!("{} unbound", folder.display());
        }
        Command::BindRoot {
            folder,
            remote_path,
        } => {
            manager.bind_root(&folder, &remote_path).await?;
            println!("{remote_path} is synchronized again");
        }
        Command::UnbindRoot {
            folder,
            remote_path,
        } => {
            let removed = manager.unbind_root(&folder, &remote_path).await?;
            println!("{remote_path} filtered out, {removed} entries removed");
        }
        Command::CleanFolder { folder } => {
            let cleaned = manager
                .clean_folder(&folder)
                .await
                .with_context(|| format!("cannot clean {}", folder.display()))?;
            println!("{cleaned} tags removed from {}", folder.display());
        }
        Command::SetConfig { key, value } => {
            manager.set_config(&key, &value).await?;
        }
        Command::Status => {
            let summary = manager.summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Console => console(manager).await?,
        Command::DeepLink(link) => deep_link(manager, link).await?,
    }
    Ok(())
}

/// Runs every engine until interrupted.
async fn console(manager: &Arc<Manager>) -> anyhow::Result<()> {
    manager.start().await?;
    info!(engines = manager.engines().len(), "running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("interrupted");
    Ok(())
}

async fn deep_link(manager: &Arc<Manager>, link: DeepLink) -> anyhow::Result<()> {
    let edited = match &link {
        DeepLink::Edit(request) => Some(request.doc_id.clone()),
        _ => None,
    };
    let Some(doc_id) = edited else {
        match manager.dispatch(link).await? {
            DispatchOutcome::Url(url) => println!("{url}"),
            DispatchOutcome::TokenStored { engines } => {
                println!("token stored for {engines} engine(s)");
            }
            DispatchOutcome::EditStarted(path) => println!("{}", path.display()),
            DispatchOutcome::Forwarded => println!("forwarded"),
        }
        return Ok(());
    };

    // Uploads and the final unlock come from the polling loops.
    let mut events = manager.events().subscribe();
    manager.start().await?;
    let DispatchOutcome::EditStarted(path) = manager.dispatch(link).await? else {
        return Ok(());
    };
    println!("editing {}", path.display());
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                info!(doc_id = %doc_id, "interrupted, the edit resumes on next start");
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(EngineEvent::DirectEditFinished { doc_id: finished }) if finished == doc_id => {
                    println!("{} saved and closed", path.display());
                    return Ok(());
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}
