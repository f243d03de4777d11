//! MUSIC command-line client
//!
//! Talks to `musicd` over the control-plane API. Every subcommand maps to
//! one POST; responses with `Error` set exit non-zero.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};

use music::api::types::*;
use music::api::{ApiClient, ApiResponse, ClientError};
use music::store::{FsmMode, ZoneType};

/// Manage a multi-signer DNSSEC controller
#[derive(Parser)]
#[command(name = "music-cli")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// musicd control-plane URL
    #[arg(short = 'H', long, env = "MUSIC_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// API key sent as X-API-Key
    #[arg(short = 'k', long, env = "MUSIC_APIKEY", default_value = "")]
    apikey: String,

    /// CA bundle used to verify the server
    #[arg(long, env = "MUSIC_ROOT_CA")]
    root_ca: Option<PathBuf>,

    /// Print raw JSON responses
    #[arg(long)]
    json: bool,

    /// No color output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that musicd answers
    Ping {
        #[arg(default_value = "ping from music-cli")]
        msg: String,
    },
    /// Manage zones and drive them through processes
    Zone {
        #[command(subcommand)]
        action: ZoneCommands,
    },
    /// Manage signers
    Signer {
        #[command(subcommand)]
        action: SignerCommands,
    },
    /// Manage signer groups
    Signergroup {
        #[command(subcommand)]
        action: GroupCommands,
    },
    /// Inspect process definitions
    Process {
        #[command(subcommand)]
        action: ProcessCommands,
    },
    /// Show daemon information
    Show {
        #[command(subcommand)]
        action: ShowCommands,
    },
    /// Query a signer directly
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },
}

#[derive(ValueEnum, Clone, Copy)]
enum ZoneTypeArg {
    Normal,
    Debug,
}

impl From<ZoneTypeArg> for ZoneType {
    fn from(arg: ZoneTypeArg) -> ZoneType {
        match arg {
            ZoneTypeArg::Normal => ZoneType::Normal,
            ZoneTypeArg::Debug => ZoneType::Debug,
        }
    }
}

#[derive(ValueEnum, Clone, Copy)]
enum FsmModeArg {
    Auto,
    Manual,
}

impl From<FsmModeArg> for FsmMode {
    fn from(arg: FsmModeArg) -> FsmMode {
        match arg {
            FsmModeArg::Auto => FsmMode::Auto,
            FsmModeArg::Manual => FsmMode::Manual,
        }
    }
}

#[derive(Args)]
struct RRsetArgs {
    zone: String,
    /// RR type, e.g. DNSKEY
    rrtype: String,
    /// Owner name, defaults to the zone apex
    #[arg(long, default_value = "")]
    owner: String,
}

#[derive(Subcommand)]
enum ZoneCommands {
    List,
    Add {
        zone: String,
        #[arg(long, value_enum)]
        zone_type: Option<ZoneTypeArg>,
        #[arg(long, value_enum)]
        fsm_mode: Option<FsmModeArg>,
        /// Join this signer group right away
        #[arg(short, long, default_value = "")]
        group: String,
    },
    Delete {
        zone: String,
    },
    Update {
        zone: String,
        #[arg(long, value_enum)]
        zone_type: Option<ZoneTypeArg>,
        #[arg(long, value_enum)]
        fsm_mode: Option<FsmModeArg>,
    },
    Join {
        zone: String,
        group: String,
    },
    Leave {
        zone: String,
        group: String,
    },
    /// Show metadata, or set KEY to VALUE
    Meta {
        zone: String,
        key: Option<String>,
        #[arg(default_value = "")]
        value: String,
    },
    /// Attach a zone to a process
    Fsm {
        zone: String,
        process: String,
        /// Signer under focus
        #[arg(short, long, default_value = "")]
        signer: String,
        /// Discard a process the zone is already in
        #[arg(long)]
        preempt: bool,
    },
    /// Detach a zone from its process
    Detach {
        zone: String,
        #[arg(default_value = "")]
        process: String,
    },
    /// Try to move a zone one transition forward
    Step {
        zone: String,
        /// Next state where there are several
        #[arg(short, long, default_value = "")]
        next: String,
    },
    /// Fetch an RRset from every signer of the zone's group
    GetRrsets(RRsetArgs),
    /// Show the cached copy of an RRset
    ListRrset(RRsetArgs),
    /// Copy records of an RRset from one signer to another
    CopyRrset {
        #[command(flatten)]
        rrset: RRsetArgs,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
}

#[derive(Subcommand)]
enum SignerCommands {
    List,
    Add {
        name: String,
        /// Backend method, e.g. ddns or hosted
        #[arg(short, long)]
        method: String,
        /// algorithm:keyname:secret for TSIG signers
        #[arg(short, long, default_value = "")]
        auth: String,
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        udp: bool,
        #[arg(long)]
        no_tsig: bool,
        #[arg(short, long, default_value = "")]
        group: String,
    },
    Update {
        name: String,
        #[arg(short, long, default_value = "")]
        method: String,
        #[arg(short, long, default_value = "")]
        auth: String,
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        use_tcp: Option<bool>,
        #[arg(long)]
        use_tsig: Option<bool>,
    },
    Delete {
        name: String,
    },
    Join {
        name: String,
        group: String,
    },
    Leave {
        name: String,
        group: String,
    },
    Login {
        name: String,
    },
    Logout {
        name: String,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    List,
    Add { name: String },
    Delete { name: String },
}

#[derive(Subcommand)]
enum ProcessCommands {
    List,
    /// Mermaid flowchart of a process
    Graph { process: String },
}

#[derive(Subcommand)]
enum ShowCommands {
    Api,
    Status,
}

#[derive(Subcommand)]
enum TestCommands {
    Dnsquery {
        signer: String,
        #[command(flatten)]
        rrset: RRsetArgs,
    },
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn zone_post(command: &str, zone: &str) -> ZonePost {
    ZonePost {
        command: command.to_string(),
        zone: zone.to_string(),
        ..ZonePost::default()
    }
}

fn signer_post(command: &str, name: &str) -> SignerPost {
    SignerPost {
        command: command.to_string(),
        name: name.to_string(),
        ..SignerPost::default()
    }
}

async fn run_zone(client: &ApiClient, action: ZoneCommands) -> Result<ApiResponse, ClientError> {
    let post = match action {
        ZoneCommands::List => zone_post("list", ""),
        ZoneCommands::Add {
            zone,
            zone_type,
            fsm_mode,
            group,
        } => ZonePost {
            zone_type: zone_type.map(Into::into),
            fsm_mode: fsm_mode.map(Into::into),
            signer_group: group,
            ..zone_post("add", &zone)
        },
        ZoneCommands::Delete { zone } => zone_post("delete", &zone),
        ZoneCommands::Update {
            zone,
            zone_type,
            fsm_mode,
        } => ZonePost {
            zone_type: zone_type.map(Into::into),
            fsm_mode: fsm_mode.map(Into::into),
            ..zone_post("update", &zone)
        },
        ZoneCommands::Join { zone, group } => ZonePost {
            signer_group: group,
            ..zone_post("join", &zone)
        },
        ZoneCommands::Leave { zone, group } => ZonePost {
            signer_group: group,
            ..zone_post("leave", &zone)
        },
        ZoneCommands::Meta { zone, key, value } => ZonePost {
            meta_key: key.unwrap_or_default(),
            meta_value: value,
            ..zone_post("meta", &zone)
        },
        ZoneCommands::Fsm {
            zone,
            process,
            signer,
            preempt,
        } => ZonePost {
            fsm: process,
            fsm_signer: signer,
            preempt,
            ..zone_post("fsm", &zone)
        },
        ZoneCommands::Detach { zone, process } => ZonePost {
            fsm: process,
            ..zone_post("detach", &zone)
        },
        ZoneCommands::Step { zone, next } => ZonePost {
            next_state: next,
            ..zone_post("step-fsm", &zone)
        },
        ZoneCommands::GetRrsets(args) => ZonePost {
            owner: args.owner,
            rrtype: args.rrtype,
            ..zone_post("get-rrsets", &args.zone)
        },
        ZoneCommands::ListRrset(args) => ZonePost {
            owner: args.owner,
            rrtype: args.rrtype,
            ..zone_post("list-rrset", &args.zone)
        },
        ZoneCommands::CopyRrset { rrset, from, to } => ZonePost {
            owner: rrset.owner,
            rrtype: rrset.rrtype,
            from_signer: from,
            to_signer: to,
            ..zone_post("copy-rrset", &rrset.zone)
        },
    };
    client.zone(&post).await
}

async fn run_signer(client: &ApiClient, action: SignerCommands) -> Result<ApiResponse, ClientError> {
    let post = match action {
        SignerCommands::List => signer_post("list", ""),
        SignerCommands::Add {
            name,
            method,
            auth,
            address,
            port,
            udp,
            no_tsig,
            group,
        } => SignerPost {
            method,
            auth,
            address,
            port,
            use_tcp: Some(!udp),
            use_tsig: Some(!no_tsig),
            signer_group: group,
            ..signer_post("add", &name)
        },
        SignerCommands::Update {
            name,
            method,
            auth,
            address,
            port,
            use_tcp,
            use_tsig,
        } => SignerPost {
            method,
            auth,
            address,
            port,
            use_tcp,
            use_tsig,
            ..signer_post("update", &name)
        },
        SignerCommands::Delete { name } => signer_post("delete", &name),
        SignerCommands::Join { name, group } => SignerPost {
            signer_group: group,
            ..signer_post("join", &name)
        },
        SignerCommands::Leave { name, group } => SignerPost {
            signer_group: group,
            ..signer_post("leave", &name)
        },
        SignerCommands::Login { name } => signer_post("login", &name),
        SignerCommands::Logout { name } => signer_post("logout", &name),
    };
    client.signer(&post).await
}

async fn run(client: &ApiClient, command: Commands) -> Result<ApiResponse, ClientError> {
    match command {
        Commands::Ping { msg } => client.ping(&msg).await,
        Commands::Zone { action } => run_zone(client, action).await,
        Commands::Signer { action } => run_signer(client, action).await,
        Commands::Signergroup { action } => {
            let (command, name) = match action {
                GroupCommands::List => ("list", String::new()),
                GroupCommands::Add { name } => ("add", name),
                GroupCommands::Delete { name } => ("delete", name),
            };
            let post = SignerGroupPost {
                command: command.to_string(),
                name,
            };
            client.signergroup(&post).await
        }
        Commands::Process { action } => {
            let (command, process) = match action {
                ProcessCommands::List => ("list", String::new()),
                ProcessCommands::Graph { process } => ("graph", process),
            };
            let post = ProcessPost {
                command: command.to_string(),
                process,
            };
            client.process(&post).await
        }
        Commands::Show { action } => match action {
            ShowCommands::Api => client.show("api").await,
            ShowCommands::Status => client.show("status").await,
        },
        Commands::Test {
            action: TestCommands::Dnsquery { signer, rrset },
        } => {
            let post = TestPost {
                command: "dnsquery".to_string(),
                signer,
                zone: rrset.zone,
                owner: rrset.owner,
                rrtype: rrset.rrtype,
            };
            client.test(&post).await
        }
    }
}

fn print_response(resp: &ApiResponse) {
    if let Some(zones) = &resp.zones {
        let mut table = Table::new();
        table.set_header(vec!["Zone", "Group", "Process", "State", "Mode", "Status", "Reason"]);
        for z in zones {
            let reason = if !z.stop_reason.is_empty() {
                z.stop_reason.clone()
            } else {
                z.delay_reason.clone()
            };
            table.add_row(vec![
                z.name.clone(),
                z.sgroup.clone(),
                z.fsm.clone(),
                z.state.clone(),
                z.fsmmode.to_string(),
                z.fsmstatus.to_string(),
                reason,
            ]);
        }
        println!("{}", table);
    }

    if let Some(signers) = &resp.signers {
        let mut table = Table::new();
        table.set_header(vec!["Signer", "Method", "Address", "Port", "TCP", "TSIG", "Auth"]);
        for s in signers {
            table.add_row(vec![
                s.name.clone(),
                s.method.clone(),
                s.address.clone(),
                s.port.to_string(),
                s.usetcp.to_string(),
                s.usetsig.to_string(),
                s.auth.clone(),
            ]);
        }
        println!("{}", table);
    }

    if let Some(groups) = &resp.signer_groups {
        let mut table = Table::new();
        table.set_header(vec!["Group", "Signers", "Zones", "In process", "Process", "Locked"]);
        for g in groups {
            table.add_row(vec![
                g.name.clone(),
                g.signer_names().join(", "),
                g.numzones.to_string(),
                g.numprocesszones.to_string(),
                g.curprocess.clone(),
                g.locked.to_string(),
            ]);
        }
        println!("{}", table);
    }

    if let Some(rrsets) = &resp.rrsets {
        for (signer, records) in rrsets {
            println!("{}", signer.bold());
            if records.is_empty() {
                println!("  {}", "(none)".dimmed());
            }
            for rr in records {
                println!("  {}", rr);
            }
        }
    }

    if let Some(metadata) = &resp.metadata {
        let mut table = Table::new();
        table.set_header(vec!["Key", "Value", "Time"]);
        for m in metadata {
            table.add_row(vec![m.key.clone(), m.value.clone(), m.time.to_rfc3339()]);
        }
        println!("{}", table);
    }

    if let Some(processes) = &resp.processes {
        let mut table = Table::new();
        table.set_header(vec!["Process", "Type", "Initial", "States", "Description"]);
        for p in processes {
            table.add_row(vec![
                p.name.clone(),
                p.ptype.to_string(),
                p.initial.clone(),
                p.states.join(" "),
                p.description.clone(),
            ]);
        }
        println!("{}", table);
    }

    if let Some(graph) = &resp.graph {
        println!("{}", graph);
    }
    if let Some(routes) = &resp.routes {
        for route in routes {
            println!("POST {}", route);
        }
    }

    if let Some(status) = &resp.status {
        let mut table = Table::new();
        table.set_header(vec!["Key", "Value"]);
        table.add_row(vec!["Scheduler active".to_string(), status.active.to_string()]);
        table.add_row(vec!["Interval".to_string(), format!("{}s", status.interval)]);
        table.add_row(vec!["Pending writes".to_string(), status.pending_writes.to_string()]);
        table.add_row(vec!["Failed writes".to_string(), status.failed_writes.to_string()]);
        table.add_row(vec!["Queued NOTIFYs".to_string(), status.queued_notifies.to_string()]);
        for q in &status.queues {
            table.add_row(vec![
                format!("Queue {}", q.backend),
                format!("{} fetch, {} update", q.fetch, q.update),
            ]);
        }
        println!("{}", table);
    }

    if let Some(pongs) = resp.pongs {
        println!("{} pong(s)", pongs);
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }

    let client = match ApiClient::new(&cli.server, &cli.apikey, cli.root_ca.as_deref()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            process::exit(1);
        }
    };

    let pb = spinner(&format!("Contacting {}", cli.server));
    let result = run(&client, cli.command).await;
    pb.finish_and_clear();

    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            process::exit(1);
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&resp) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("{} {}", "✗".red().bold(), e),
        }
    } else {
        print_response(&resp);
        if !resp.msg.is_empty() && !resp.error {
            println!("{} {}", "✓".green().bold(), resp.msg);
        }
    }

    if resp.error {
        eprintln!("{} {}", "✗".red().bold(), resp.error_msg);
        process::exit(1);
    }
}
