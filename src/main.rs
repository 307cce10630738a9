use anyhow::{bail, Context, Result};
use drugcell::cli::{parse_args, setup_logging, Commands, TrainArgs};
use drugcell::data::loader::{load_feature_table, load_mapping, load_ontology, prepare_train_data};
use drugcell::model::checkpoint::FileCheckpointSink;
use drugcell::model::ModelConfig;
use drugcell::training::{trainer::Trainer, PalmConfig, TrainingConfig};
use drugcell::utils::{format_duration, ExecutionContext};
use drugcell::TrainBackend;
use tracing::{error, info};

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", drugcell::info());

    let result = match cli.command {
        Commands::Train(args) => run_train(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_train(args: TrainArgs) -> Result<()> {
    info!("Start....");

    let (data, cell2id, drug2id) =
        prepare_train_data(&args.train, &args.test, &args.cell2id, &args.drug2id)?;
    info!(
        "{} training and {} test samples over {} cell lines and {} drugs",
        data.train.len(),
        data.test.len(),
        cell2id.len(),
        drug2id.len()
    );

    let gene2id = load_mapping(&args.gene2id)?;
    info!("Total number of genes = {}", gene2id.len());

    // columns of the mutation matrix are addressed by gene id
    let mut gene_ids: Vec<usize> = gene2id.values().copied().collect();
    gene_ids.sort_unstable();
    if gene_ids.iter().enumerate().any(|(i, &id)| i != id) {
        bail!("Gene ids in {:?} must be exactly 0..{}", args.gene2id, gene2id.len());
    }

    let cell_features = load_feature_table(&args.cellline)?
        .select_columns(&gene_ids)
        .context("Mutation matrix is narrower than the gene mapping")?;
    let drug_features = load_feature_table(&args.fingerprint)?;

    let ontology = load_ontology(&args.onto, &gene2id)?;

    let context = ExecutionContext::<TrainBackend>::with_fallback(args.cuda);

    let model_config = ModelConfig::new(gene2id.len(), drug_features.cols, args.drug_hiddens.clone())
        .with_num_hiddens_genotype(args.genotype_hiddens)
        .with_num_hiddens_final(args.final_hiddens);

    let training_config = TrainingConfig {
        epochs: args.epoch,
        batch_size: args.batchsize,
        learning_rate: args.lr,
        device_id: args.cuda,
        palm: args.palm.then(PalmConfig::default),
        ..TrainingConfig::default()
    };

    let mut sink = FileCheckpointSink::new(&args.modeldir)?;
    let mut trainer = Trainer::new(training_config, model_config, context);

    let (_, result) = trainer
        .train(&ontology, &data, &cell_features, &drug_features, &mut sink)
        .context("Training failed")?;

    info!("=== Training Results ===");
    info!("Total epochs: {}", result.state.epoch);
    info!(
        "Best epoch: {} (test correlation {:.6})",
        result.state.best_epoch, result.state.max_corr
    );
    info!(
        "Active ontology: {} nodes, {} edges",
        result.active_graph.nodes, result.active_graph.edges
    );
    info!("Training time: {}", format_duration(result.duration_secs));
    info!("Model saved to: {:?}", sink.model_path());

    Ok(())
}
