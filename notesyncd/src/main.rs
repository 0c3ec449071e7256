use std::path::PathBuf;

use notesyncd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliCommand {
    List,
    Status,
    New { title: String, body: String },
    Import(Vec<PathBuf>),
    Show(String),
    Forget(String),
    Push(String),
    Pull(String),
    PushAll,
    Set { key: String, value: String },
    Help,
}

const USAGE: &str = "\
Usage: notesyncd <command>
  list                 List notes with their sync state
  status               Show configuration and registry summary
  new <title> [body]   Create a note in the save location
  import <path>...     Register existing markdown files
  show <note>          Print a note, refreshing it first when auto-sync is on
  forget <note>        Drop a note whose file is gone
  push <note>          Upload one note
  pull <note>          Download one note if the remote copy is newer
  push-all             Upload every note
  set <key> <value>    Save a setting (accessKey, secretKey, bucketName,
                       enableAutoSync, savedLocation)

<note> is a note id or an exact title.";

fn parse_cli<I>(args: I) -> anyhow::Result<CliCommand>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliCommand::Help);
    };
    let rest: Vec<String> = args.collect();
    let command = match (command.as_str(), rest.as_slice()) {
        ("--help" | "-h" | "help", _) => CliCommand::Help,
        ("list", []) => CliCommand::List,
        ("status", []) => CliCommand::Status,
        ("new", [title]) => CliCommand::New {
            title: title.clone(),
            body: String::new(),
        },
        ("new", [title, body]) => CliCommand::New {
            title: title.clone(),
            body: body.clone(),
        },
        ("import", paths) if !paths.is_empty() => {
            CliCommand::Import(paths.iter().map(PathBuf::from).collect())
        }
        ("show", [note]) => CliCommand::Show(note.clone()),
        ("forget", [note]) => CliCommand::Forget(note.clone()),
        ("push", [note]) => CliCommand::Push(note.clone()),
        ("pull", [note]) => CliCommand::Pull(note.clone()),
        ("push-all", []) => CliCommand::PushAll,
        ("set", [key, value]) => CliCommand::Set {
            key: key.clone(),
            value: value.clone(),
        },
        (other, _) => anyhow::bail!("unknown or incomplete command: {other}"),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    notesyncd::setup_logging();

    let command = parse_cli(std::env::args())?;
    if command == CliCommand::Help {
        println!("{USAGE}");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let mut runtime = DaemonRuntime::bootstrap(config).await?;
    let output = match command {
        CliCommand::List => runtime.list().await,
        CliCommand::Status => runtime.status().await,
        CliCommand::New { title, body } => runtime.create(&title, &body).await?,
        CliCommand::Import(paths) => runtime.import(&paths).await?,
        CliCommand::Show(note) => runtime.show(&note).await?,
        CliCommand::Forget(note) => runtime.forget(&note).await?,
        CliCommand::Push(note) => runtime.push(&note).await?,
        CliCommand::Pull(note) => runtime.pull(&note).await?,
        CliCommand::PushAll => runtime.push_all().await?,
        CliCommand::Set { key, value } => runtime.set(&key, &value).await?,
        CliCommand::Help => String::new(),
    };
    let output = output.trim_end();
    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
