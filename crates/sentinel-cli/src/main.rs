use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

#[zbus::proxy(
    interface = "org.sentinel.Sentinel1",
    default_service = "org.sentinel.Sentinel1",
    default_path = "/org/sentinel/Sentinel1"
)]
trait Sentinel {
    async fn enroll(&self, user: &str) -> zbus::Result<String>;
    async fn verify(&self, user: &str) -> zbus::Result<bool>;
    async fn list_models(&self, user: &str) -> zbus::Result<String>;
    async fn remove_model(&self, user: &str, model_id: &str) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
    async fn arm_motion(&self) -> zbus::Result<bool>;
    async fn disarm_motion(&self) -> zbus::Result<bool>;
    async fn power_action(&self, action: &str) -> zbus::Result<String>;
    async fn power_button(&self) -> zbus::Result<bool>;
    async fn set_sound_alert(&self, enabled: bool) -> zbus::Result<()>;
    async fn set_stealth_mode(&self, enabled: bool) -> zbus::Result<()>;
    async fn unlock(&self, method: &str, secret: &str) -> zbus::Result<bool>;
    async fn set_secret(&self, method: &str, current: &str, secret: &str) -> zbus::Result<()>;
    async fn add_contact(&self, name: &str, recipient: &str) -> zbus::Result<()>;
    async fn list_contacts(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "sentinel", about = "Sentinel anti-theft CLI")]
struct Cli {
    /// Talk to a daemon on the session bus
    #[arg(long, global = true)]
    session: bool,

    /// User whose face models to act on (default: $USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Switch {
    On,
    Off,
}

impl Switch {
    fn enabled(self) -> bool {
        self == Switch::On
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face held inside the guide region
    Enroll,
    /// Verify your face against enrolled models
    Verify,
    /// List enrolled face models
    List,
    /// Remove an enrolled face model
    Remove {
        /// Model ID to remove
        id: String,
    },
    /// Show daemon status
    Status,
    /// Arm the motion detector
    Arm,
    /// Disarm the motion detector and silence any alarm
    Disarm,
    /// Choose a power menu action (power-off, restart, lock)
    Power { action: String },
    /// Report a power button press
    PowerButton,
    /// Turn the alarm sound on or off
    Sound { state: Switch },
    /// Turn stealth mode on or off
    Stealth { state: Switch },
    /// Attempt an unlock (pin, password, face)
    Unlock {
        method: String,
        /// PIN or password; not used for face
        secret: Option<String>,
    },
    /// Set the PIN or password
    SetSecret {
        method: String,
        secret: String,
        /// The secret being replaced, once one is set
        #[arg(long)]
        current: Option<String>,
    },
    /// Manage emergency contacts
    Contacts {
        #[command(subcommand)]
        command: ContactCommands,
    },
}

#[derive(Subcommand)]
enum ContactCommands {
    /// Add an emergency contact
    Add { name: String, recipient: String },
    /// List emergency contacts
    List,
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

fn current_user(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "owner".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let user = current_user(cli.user);

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = SentinelProxy::new(&connection)
        .await
        .context("sentineld is not reachable")?;
    tracing::debug!(user = %user, "connected to sentineld");

    match cli.command {
        Commands::Enroll => {
            println!("Hold your face inside the guide until it is captured...");
            let id = proxy.enroll(&user).await?;
            println!("Enrolled model {id}");
        }
        Commands::Verify => {
            println!("Verifying face...");
            if proxy.verify(&user).await? {
                println!("Match");
            } else {
                println!("No match");
            }
        }
        Commands::List => println!("{}", pretty(&proxy.list_models(&user).await?)),
        Commands::Remove { id } => {
            if proxy.remove_model(&user, &id).await? {
                println!("Removed model {id}");
            } else {
                anyhow::bail!("no model {id} for {user}");
            }
        }
        Commands::Status => println!("{}", pretty(&proxy.status().await?)),
        Commands::Arm => {
            if proxy.arm_motion().await? {
                println!("Motion detector armed");
            } else {
                println!("Motion detector was already armed");
            }
        }
        Commands::Disarm => {
            let silenced = proxy.disarm_motion().await?;
            println!("Motion detector disarmed");
            if silenced {
                println!("Alarm silenced");
            }
        }
        Commands::Power { action } => println!("{}", pretty(&proxy.power_action(&action).await?)),
        Commands::PowerButton => {
            if proxy.power_button().await? {
                println!("Power menu shown");
            }
        }
        Commands::Sound { state } => {
            proxy.set_sound_alert(state.enabled()).await?;
            println!("Sound alert {}", if state.enabled() { "on" } else { "off" });
        }
        Commands::Stealth { state } => {
            proxy.set_stealth_mode(state.enabled()).await?;
            println!("Stealth mode {}", if state.enabled() { "on" } else { "off" });
        }
        Commands::Unlock { method, secret } => {
            let secret = secret.unwrap_or_default();
            if proxy.unlock(&method, &secret).await? {
                println!("Unlocked");
            } else {
                anyhow::bail!("unlock rejected");
            }
        }
        Commands::SetSecret {
            method,
            secret,
            current,
        } => {
            proxy
                .set_secret(&method, &current.unwrap_or_default(), &secret)
                .await?;
            println!("{method} updated");
        }
        Commands::Contacts { command } => match command {
            ContactCommands::Add { name, recipient } => {
                proxy.add_contact(&name, &recipient).await?;
                println!("Added {name}");
            }
            ContactCommands::List => println!("{}", pretty(&proxy.list_contacts().await?)),
        },
    }

    Ok(())
}
