use anyhow::{Context, Result};
use cpgnet::cli::{
    parse_args, setup_logging, BuildArgs, BuildConfig, Commands, InfoArgs, JoinArgs,
    TransplantArgs,
};
use cpgnet::model::builders::{build_cpg_model, build_dna_model};
use cpgnet::model::joint::{get_joint, join_models};
use cpgnet::model::persist::{copy_weights, load_model, save_model};
use cpgnet::model::{BranchParams, JointParams, TargetParams};
use cpgnet::DefaultBackend;
use tracing::{error, info};

type Device = <DefaultBackend as burn::tensor::backend::Backend>::Device;

fn main() {
    let cli = parse_args();

    setup_logging(cli.verbose);

    info!("{}", cpgnet::info());

    let result = match cli.command {
        Commands::Build(args) => run_build(args),
        Commands::Join(args) => run_join(args),
        Commands::Transplant(args) => run_transplant(args),
        Commands::Info(args) => run_info(args),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn save_into(model: &cpgnet::Model<DefaultBackend>, dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    save_model(
        model,
        &dir.join("model.json"),
        Some(&dir.join("model_weights.mpk")),
    )
    .context("Failed to save model")?;
    Ok(())
}

fn run_build(args: BuildArgs) -> Result<()> {
    info!("Building model...");
    info!("Config file: {:?}", args.config);
    info!("Output directory: {:?}", args.output);

    let config: BuildConfig = serde_json::from_str(
        &std::fs::read_to_string(&args.config)
            .with_context(|| format!("Failed to read config from {:?}", args.config))?,
    )
    .context("Failed to parse build config")?;

    let device = Device::default();
    let branch = config.branch.unwrap_or_else(BranchParams::new);
    let mut model = match config.kind.as_str() {
        "dna" => {
            let seq_len = config
                .seq_len
                .context("dna models need `seq_len` in the build config")?;
            build_dna_model::<DefaultBackend>(&branch, seq_len, &device)?
        }
        "cpg" => {
            let nb_replicate = config
                .nb_replicate
                .context("cpg models need `nb_replicate` in the build config")?;
            let cpg_wlen = config
                .cpg_wlen
                .context("cpg models need `cpg_wlen` in the build config")?;
            build_cpg_model::<DefaultBackend>(&branch, nb_replicate, cpg_wlen, &device)?
        }
        other => anyhow::bail!("unknown model kind '{}'; known: dna, cpg", other),
    };

    if !config.outputs.is_empty() {
        let target = config.target.unwrap_or_else(TargetParams::new);
        model.add_output_layers(&config.outputs, &target, &device)?;
    }

    info!(
        "Built '{}' with {} layers and {} parameters",
        model.name,
        model.layers().count(),
        model.num_params()
    );
    save_into(&model, &args.output)?;
    Ok(())
}

fn run_join(args: JoinArgs) -> Result<()> {
    info!("Joining {} sub-models...", args.models.len());

    let device = Device::default();
    let kind = get_joint(&args.variant)?;

    let mut models = Vec::with_capacity(args.models.len());
    for path in &args.models {
        let model = load_model::<DefaultBackend>(&[path.clone()], &device)
            .with_context(|| format!("Failed to load sub-model from {:?}", path))?;
        info!(
            "Loaded '{}' with feature width {}",
            model.name,
            model.feature_width()
        );
        models.push(model);
    }

    let params = JointParams::new()
        .with_nb_hidden(args.nb_hidden)
        .with_drop_out(args.drop_out);
    let mut joint = join_models(kind, &params, models, &device)?;

    if !args.outputs.is_empty() {
        joint.add_output_layers(&args.outputs, &TargetParams::new(), &device)?;
    }

    info!(
        "Joint model has feature width {} and {} parameters",
        joint.feature_width(),
        joint.num_params()
    );
    save_into(&joint, &args.output)?;
    Ok(())
}

fn run_transplant(args: TransplantArgs) -> Result<()> {
    info!("Transplanting weights...");
    info!("Source: {:?}", args.src);
    info!("Destination: {:?}", args.dst);

    let device = Device::default();
    let src = load_model::<DefaultBackend>(&[args.src.clone()], &device)
        .with_context(|| format!("Failed to load source model from {:?}", args.src))?;
    let mut dst = load_model::<DefaultBackend>(&[args.dst.clone()], &device)
        .with_context(|| format!("Failed to load destination model from {:?}", args.dst))?;

    let copied = copy_weights(&src, &mut dst, args.must_exist, &device)?;
    info!("Copied {} layers:", copied.len());
    for name in &copied {
        info!("  {}", name);
    }

    save_into(&dst, &args.output)?;
    Ok(())
}

fn run_info(args: InfoArgs) -> Result<()> {
    let device = Device::default();
    let model = load_model::<DefaultBackend>(&[args.model.clone()], &device)
        .with_context(|| format!("Failed to load model from {:?}", args.model))?;

    println!("Model: {}", model.name);
    if let Some(scope) = &model.scope {
        println!("Scope: {}", scope);
    }
    println!("Inputs:");
    for branch in model.branches() {
        for (name, shape) in branch
            .input
            .input_names()
            .iter()
            .zip(branch.input.input_shapes())
        {
            println!("  {} {:?}", name, shape);
        }
    }
    println!("Layers:");
    for layer in model.layers() {
        println!("  {:<24} {:>10} params", layer.name, layer.spec.num_params());
    }
    println!("Outputs:");
    for head in model.heads() {
        println!("  {} ({:?})", head.name, head.loss);
    }
    println!("Feature width: {}", model.feature_width());
    println!("Total parameters: {}", model.num_params());
    Ok(())
}
