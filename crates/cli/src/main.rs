use clap::{Parser, Subcommand};
use lib::api::{ApiClient, ChatSummary, NewPatient};
use lib::chat::{Attachment, ChatSession};
use lib::config::{self, Config};
use lib::conversation::{MessageState, Role};
use lib::session::{FileCredentialStore, SessionState};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "medra")]
#[command(about = "Medra CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Sign in with email and password. The token is saved for later commands.
    Login {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        email: String,

        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },

    /// Create an account and sign in.
    Register {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[arg(long)]
        email: String,

        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,

        /// Display name (default: the part of the email before '@')
        #[arg(long)]
        name: Option<String>,
    },

    /// Forget the saved token.
    Logout {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Show the signed-in doctor.
    Whoami {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// List patients, newest first.
    Patients {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Add, show or delete a patient.
    Patient {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        #[command(subcommand)]
        action: PatientAction,
    },

    /// List chats, or start one with `chats new`.
    Chats {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Only chats for this patient.
        #[arg(long, value_name = "ID", conflicts_with = "general")]
        patient: Option<String>,

        /// Only chats not tied to a patient.
        #[arg(long)]
        general: bool,

        #[command(subcommand)]
        action: Option<ChatsAction>,
    },

    /// Chat with the assistant in an existing chat (interactive). Replies stream as they arrive.
    Chat {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        chat_id: String,
    },

    /// Run the in-memory reference backend.
    Serve {
        /// Config file path (default: MEDRA_CONFIG_PATH or ~/.medra/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 8000)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum PatientAction {
    /// Add a patient and print its id.
    Add {
        #[arg(long)]
        name: String,

        /// Medical record number.
        #[arg(long)]
        mrn: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Show a patient with their chats, recent messages and files.
    Show { id: String },

    /// Delete a patient. Their chats are kept.
    Rm { id: String },
}

#[derive(Subcommand)]
enum ChatsAction {
    /// Start a chat and print its id: a consult with --patient, otherwise a general chat.
    New {
        #[arg(long, value_name = "ID")]
        patient: Option<String>,

        #[arg(long)]
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let (name, result) = match cli.command {
        Some(Commands::Version) => {
            println!("medra {}", env!("CARGO_PKG_VERSION"));
            return;
        }
        Some(Commands::Login {
            config,
            email,
            password,
        }) => ("login", run_login(config, email, password).await),
        Some(Commands::Register {
            config,
            email,
            password,
            name,
        }) => ("register", run_register(config, email, password, name).await),
        Some(Commands::Logout { config }) => ("logout", run_logout(config).await),
        Some(Commands::Whoami { config }) => ("whoami", run_whoami(config).await),
        Some(Commands::Patients { config }) => ("patients", run_patients(config).await),
        Some(Commands::Patient { config, action }) => ("patient", run_patient(config, action).await),
        Some(Commands::Chats {
            config,
            action: Some(ChatsAction::New { patient, title }),
            ..
        }) => ("chats new", run_new_chat(config, patient, title).await),
        Some(Commands::Chats {
            config,
            patient,
            general,
            action: None,
        }) => ("chats", run_chats(config, patient, general).await),
        Some(Commands::Chat { config, chat_id }) => ("chat", run_chat(config, chat_id).await),
        Some(Commands::Serve { config, port }) => ("serve", run_serve(config, port).await),
        None => {
            println!("Run with --help for usage");
            return;
        }
    };
    if let Err(e) = result {
        log::error!("{} failed: {}", name, e);
        std::process::exit(1);
    }
}

struct Context {
    config: Config,
    client: ApiClient,
    session: SessionState,
}

/// Load config, wire the client and session, and restore any saved sign-in.
async fn open_session(config_path: Option<PathBuf>) -> anyhow::Result<Context> {
    let (config, _) = config::load_config(config_path)?;
    let client = ApiClient::new(Some(config::resolve_api_base_url(&config)));
    let store = FileCredentialStore::new(config::resolve_credentials_path(&config));
    let session = SessionState::new(Arc::new(client.clone()), Arc::new(store));
    session.initialize().await;
    Ok(Context {
        config,
        client,
        session,
    })
}

fn read_password(given: Option<String>) -> anyhow::Result<String> {
    if let Some(p) = given {
        return Ok(p);
    }
    let mut stdout = io::stdout();
    write!(stdout, "Password: ")?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_login(
    config_path: Option<PathBuf>,
    email: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let password = read_password(password)?;
    let credential = ctx.session.login(&email, &password).await?;
    println!("signed in as {}", credential.name);
    Ok(())
}

async fn run_register(
    config_path: Option<PathBuf>,
    email: String,
    password: Option<String>,
    name: Option<String>,
) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let password = read_password(password)?;
    let credential = ctx
        .session
        .register(&email, &password, name.as_deref())
        .await?;
    println!("registered and signed in as {}", credential.name);
    Ok(())
}

async fn run_logout(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    ctx.session.logout();
    println!("signed out");
    Ok(())
}

async fn run_whoami(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    match ctx.session.user() {
        Some(user) => {
            println!("{} <{}>", user.name, user.email);
            if let Some(specialty) = user.specialty {
                println!("specialty: {}", specialty);
            }
        }
        None => println!("not signed in"),
    }
    Ok(())
}

async fn run_patients(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let credential = ctx.session.credential()?;
    let patients = ctx.client.list_patients(&credential).await?;
    if patients.is_empty() {
        println!("no patients");
    }
    for p in patients {
        println!("{}\t{}\t{}", p.id, p.name, p.mrn.unwrap_or_default());
    }
    Ok(())
}

async fn run_patient(config_path: Option<PathBuf>, action: PatientAction) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let credential = ctx.session.credential()?;
    match action {
        PatientAction::Add { name, mrn, notes } => {
            let patient = ctx
                .client
                .create_patient(&credential, &NewPatient { name, mrn, notes })
                .await?;
            println!("{}", patient.id);
        }
        PatientAction::Show { id } => {
            let profile = ctx.client.patient_profile(&credential, &id).await?;
            let p = &profile.patient;
            println!("{}\t{}\t{}", p.id, p.name, p.mrn.as_deref().unwrap_or(""));
            if let Some(notes) = p.notes.as_deref().filter(|n| !n.is_empty()) {
                println!("notes: {}", notes);
            }
            println!("chats:");
            for chat in &profile.chats {
                print_chat(chat);
            }
            println!("recent messages:");
            for m in &profile.recent_messages {
                println!("{}\t{}", m.role, m.text.replace('\n', " "));
            }
            println!("files:");
            for f in &profile.files {
                println!(
                    "{}\t{}",
                    f.file_name.as_deref().unwrap_or(""),
                    ctx.client.resolve_media_url(&f.media_url)
                );
            }
        }
        PatientAction::Rm { id } => {
            ctx.client.delete_patient(&credential, &id).await?;
            println!("deleted {}", id);
        }
    }
    Ok(())
}

async fn run_new_chat(
    config_path: Option<PathBuf>,
    patient: Option<String>,
    title: Option<String>,
) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let credential = ctx.session.credential()?;
    let chat = match patient.as_deref() {
        Some(id) => ctx.client.create_chat(&credential, id, title.as_deref()).await?,
        None => ctx.client.create_general_chat(&credential, title.as_deref()).await?,
    };
    print_chat(&chat);
    Ok(())
}

fn print_chat(chat: &ChatSummary) {
    let scope = if chat.is_general {
        "general".to_string()
    } else {
        chat.patient_name.clone().unwrap_or_default()
    };
    println!(
        "{}\t{}\t{}",
        chat.id,
        chat.title.as_deref().unwrap_or("(untitled)"),
        scope
    );
}

async fn run_chats(
    config_path: Option<PathBuf>,
    patient: Option<String>,
    general: bool,
) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    let credential = ctx.session.credential()?;
    let chats = if general {
        ctx.client.list_general_chats(&credential).await?
    } else {
        ctx.client.list_chats(&credential, patient.as_deref()).await?
    };
    if chats.is_empty() {
        println!("no chats");
    }
    for chat in &chats {
        print_chat(chat);
    }
    Ok(())
}

fn role_prefix(role: Role) -> &'static str {
    match role {
        Role::User => ">",
        Role::Assistant => "<",
        Role::System => "#",
    }
}

async fn run_chat(config_path: Option<PathBuf>, chat_id: String) -> anyhow::Result<()> {
    let ctx = open_session(config_path).await?;
    ctx.session.credential()?;
    let refresh = ctx
        .session
        .spawn_refresh_loop(config::resolve_refresh_interval(&ctx.config));
    let chat = ChatSession::new(ctx.client.clone(), ctx.session.clone());
    let mut conversation = chat.load(&chat_id).await?;
    for m in conversation.messages() {
        println!("{} {}", role_prefix(m.role), m.text.trim());
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut attachment: Option<Attachment> = None;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if let Some(path) = input.strip_prefix("/attach ") {
            let path = PathBuf::from(path.trim());
            match std::fs::read(&path) {
                Ok(bytes) => {
                    let file_name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "upload".to_string());
                    println!("attached {} ({} bytes)", file_name, bytes.len());
                    attachment = Some(Attachment { file_name, bytes });
                }
                Err(e) => eprintln!("cannot read {}: {}", path.display(), e),
            }
            continue;
        }
        if input.is_empty() && attachment.is_none() {
            continue;
        }

        print!("< ");
        stdout.flush()?;
        let mut echo = |token: &str| {
            let mut out = io::stdout();
            let _ = out.write_all(token.as_bytes());
            let _ = out.flush();
        };
        let sent = chat
            .send(&mut conversation, &chat_id, input, attachment.take(), &mut echo)
            .await;
        println!();
        if let Err(e) = sent {
            eprintln!("chat error: {}", e);
            if !ctx.session.is_authenticated() {
                break;
            }
        }
    }

    let interrupted = conversation
        .messages()
        .iter()
        .filter(|m| m.state == MessageState::Interrupted)
        .count();
    if interrupted > 0 {
        log::info!("{} reply(ies) ended early in this chat", interrupted);
    }
    refresh.abort();
    Ok(())
}

async fn run_serve(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, _) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.backend.port = p;
    }
    log::info!("starting reference backend on {}:{}", config.backend.bind, config.backend.port);
    lib::backend::run_backend(config).await
}
