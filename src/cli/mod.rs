use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// DrugCell: ontology-structured drug response model
#[derive(Parser, Debug)]
#[command(name = "drugcell")]
#[command(about = "Train ontology-structured drug response models")]
#[command(version)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train a new model
    Train(TrainArgs),
}

/// Training arguments
#[derive(Parser, Debug)]
pub struct TrainArgs {
    /// Ontology file (`parent<TAB>child<TAB>type`)
    #[arg(long, required = true)]
    pub onto: PathBuf,

    /// Training samples (`cell<TAB>drug<TAB>response`)
    #[arg(long, required = true)]
    pub train: PathBuf,

    /// Test samples, same format as --train
    #[arg(long, required = true)]
    pub test: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value = "300")]
    pub epoch: usize,

    /// Learning rate
    #[arg(long, default_value = "0.001")]
    pub lr: f64,

    /// Batch size
    #[arg(long, default_value = "3000")]
    pub batchsize: usize,

    /// Folder the checkpoint is written to
    #[arg(long, default_value = "MODEL/")]
    pub modeldir: PathBuf,

    /// Accelerator id
    #[arg(long, default_value = "0")]
    pub cuda: usize,

    /// Gene to id mapping file
    #[arg(long, required = true)]
    pub gene2id: PathBuf,

    /// Drug to id mapping file
    #[arg(long, required = true)]
    pub drug2id: PathBuf,

    /// Cell line to id mapping file
    #[arg(long, required = true)]
    pub cell2id: PathBuf,

    /// Hidden units per ontology term
    #[arg(long = "genotype-hiddens", default_value = "3")]
    pub genotype_hiddens: usize,

    /// Drug branch layer sizes, comma separated
    #[arg(long = "drug-hiddens", value_delimiter = ',', default_values_t = [100, 50, 3])]
    pub drug_hiddens: Vec<usize>,

    /// Hidden units of the final layer
    #[arg(long = "final-hiddens", default_value = "3")]
    pub final_hiddens: usize,

    /// Cell line mutation matrix (comma separated)
    #[arg(long, required = true)]
    pub cellline: PathBuf,

    /// Drug fingerprint matrix (comma separated)
    #[arg(long, required = true)]
    pub fingerprint: PathBuf,

    /// Run a PALM pruning step after every backward pass
    #[arg(long)]
    pub palm: bool,
}

/// Parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Setup logging based on verbosity
pub fn setup_logging(verbose: bool) {
    let filter = if verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
