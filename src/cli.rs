use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lab", about = "Disposable libvirt lab exercises for hands-on training")]
pub struct Cli {
    /// Path to lab.toml (default: user config dir, then /etc/lab/lab.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Base directory holding labs and exercise state (overrides config)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    /// Show debug logging on stderr
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print results
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Auto, global = true)]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Spinners on a terminal, plain lines otherwise
    Auto,
    /// Plain text lines
    Plain,
    /// Machine-readable JSON on stdout
    Json,
    #[value(skip)]
    Interactive,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTarget {
    /// Lab categories
    Categories,
    /// Running exercises
    Active,
    /// Saved exercises
    Suspended,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List categories or exercises
    List { target: ListTarget },

    /// List the labs in a category
    #[command(name = "list_labs", alias = "list-labs")]
    ListLabs { category: String },

    /// Describe a lab (`info <category> <lab>`) or an exercise (`info <id>`)
    Info {
        /// Category, or an exercise ID when given alone
        first: String,
        /// Lab name
        lab: Option<String>,
    },

    /// Start a new exercise from a lab
    Start { category: String, lab: String },

    /// Stop an exercise and delete its VMs
    Stop { id: String },

    /// Save a running exercise's VMs to disk
    #[command(alias = "suspend")]
    Save { id: String },

    /// Restore a saved exercise
    Resume { id: String },

    /// Create an empty lab
    #[command(name = "create_lab", alias = "create-lab")]
    CreateLab { category: String, name: String },

    /// Add a VM to an existing lab
    #[command(name = "create_vm", alias = "create-vm")]
    CreateVm {
        category: String,
        lab: String,
        name: String,

        /// libosinfo OS variant (see `virt-install --osinfo list`)
        #[arg(short, long)]
        os_variant: String,

        /// Disk size for a fresh install (default from config)
        #[arg(short, long)]
        size: Option<String>,

        /// Number of vCPUs (default from config)
        #[arg(short, long)]
        cpus: Option<u32>,

        /// Memory in MiB (default from config)
        #[arg(short, long)]
        memory: Option<u64>,

        /// Copy an existing qcow2 as the base image
        #[arg(short, long, conflicts_with = "iso")]
        existing_qcow2: Option<PathBuf>,

        /// Install from this ISO
        #[arg(short, long)]
        iso: Option<PathBuf>,
    },

    /// Create the base directory layout
    Init,
}
