use std::fs;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;

use comfyui_case_patcher::pools::store::{Section, DEFAULT_MODE};
use comfyui_case_patcher::prompt::sampler::{sample, SampleOptions, SectionOverrides};
use comfyui_case_patcher::utils::overrides::parse_count_pairs;
use comfyui_case_patcher::workflow::patch::{
    ControlNetArgs, IpAdapterArgs, Overrides, PatchSession, TextNodes,
};
use comfyui_case_patcher::{AppError, AppResult, Config, MergedPool, PoolStore};

#[derive(Parser, Debug)]
#[command(name = "casectl", about = "CASE prompt generation and ComfyUI workflow patching", version)]
struct Cli {
    /// Override CASE_POOLS_PATH
    #[arg(global = true, long, value_name = "PATH")]
    pools: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render a CASE prompt to stdout
    Generate(GenerateArgs),
    /// Patch a ComfyUI workflow JSON with a generated CASE prompt
    Apply(ApplyArgs),
    /// List pool subcategories, negative groups, and style presets
    List {
        /// Pool modes to blend (e.g. general mature)
        #[arg(long = "mode", num_args = 1..)]
        modes: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct PromptFlags {
    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
    /// Pool modes to blend (e.g. general mature)
    #[arg(long = "mode", num_args = 1..)]
    modes: Vec<String>,
    /// Shortcut for blending the mature pool with the general set
    #[arg(long)]
    mature: bool,
    /// Optional style preset name (e.g. romantic, noir, aftercare)
    #[arg(long)]
    style_preset: Option<String>,
    /// Optional negative prompt groups to include
    #[arg(long = "neg-groups", num_args = 1..)]
    neg_groups: Vec<String>,
    /// Composition overrides (e.g. quality=2 lighting=1)
    #[arg(long, num_args = 1.., value_name = "KEY=COUNT")]
    composition: Vec<String>,
    /// Overrides for action subcategories
    #[arg(long, num_args = 1.., value_name = "KEY=COUNT")]
    action: Vec<String>,
    /// Overrides for subject subcategories
    #[arg(long, num_args = 1.., value_name = "KEY=COUNT")]
    subject: Vec<String>,
    /// Overrides for environment subcategories
    #[arg(long, num_args = 1.., value_name = "KEY=COUNT")]
    environment: Vec<String>,
    /// Default number of tokens drawn per subcategory
    #[arg(long, default_value_t = 1)]
    default_count: usize,
    /// Delimiter used when joining tokens inside each CASE block
    #[arg(long, default_value = ", ")]
    delimiter: String,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[command(flatten)]
    prompt: PromptFlags,
    /// Emit prompts without headers, ready for CLIP input
    #[arg(long)]
    flat: bool,
}

#[derive(Args, Debug)]
struct ApplyArgs {
    #[command(flatten)]
    prompt: PromptFlags,
    /// Path to the ComfyUI workflow JSON
    #[arg(long, value_name = "PATH")]
    workflow: PathBuf,
    /// Optional output path; defaults to updating the workflow in place
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Node id for the positive CLIPTextEncode block
    #[arg(long, default_value = "6")]
    pos_node: String,
    /// Node id for the negative CLIPTextEncode block
    #[arg(long, default_value = "7")]
    neg_node: String,
    /// Override LoRA strength for the diffusion model
    #[arg(long)]
    lora_strength_model: Option<f64>,
    /// Override LoRA strength for the CLIP encoder
    #[arg(long)]
    lora_strength_clip: Option<f64>,
    /// Set CLIP stop layer (e.g. -2 for Pony XL, -1 for stronger LoRA influence)
    #[arg(long, allow_hyphen_values = true)]
    clip_layer: Option<i64>,
    /// Inject a ControlNet pipeline between prompts and sampler
    #[arg(long)]
    add_controlnet: bool,
    /// ControlNet model filename (must exist under models/controlnet)
    #[arg(long)]
    controlnet: Option<String>,
    /// Path to reference image; will be copied into the ComfyUI input directory
    #[arg(long, value_name = "PATH")]
    control_image: Option<PathBuf>,
    /// ControlNet strength
    #[arg(long, default_value_t = 0.9)]
    control_strength: f64,
    /// ControlNet start percent (0-1)
    #[arg(long, default_value_t = 0.0)]
    control_start: f64,
    /// ControlNet end percent (0-1)
    #[arg(long, default_value_t = 1.0)]
    control_end: f64,
    /// Insert an IPAdapter loader and apply node into the workflow
    #[arg(long)]
    add_ipadapter: bool,
    /// Reference image for IPAdapter; copied into the ComfyUI input directory
    #[arg(long, value_name = "PATH")]
    ipadapter_image: Option<PathBuf>,
    /// Preset name for the IPAdapter unified loader
    #[arg(long, default_value = "PLUS (high strength)")]
    ipadapter_preset: String,
    /// IPAdapter weight
    #[arg(long, default_value_t = 0.85)]
    ipadapter_weight: f64,
    /// IPAdapter weight type (see IPAdapter docs)
    #[arg(long, default_value = "style and composition")]
    ipadapter_weight_type: String,
    /// IPAdapter combine embeds mode (concat/add/average/etc.)
    #[arg(long, default_value = "average")]
    ipadapter_combine: String,
    /// IPAdapter start percent (0-1)
    #[arg(long, default_value_t = 0.0)]
    ipadapter_start: f64,
    /// IPAdapter end percent (0-1)
    #[arg(long, default_value_t = 0.7)]
    ipadapter_end: f64,
    /// IPAdapter embeds scaling option
    #[arg(long, default_value = "K+mean(V) w/ C penalty")]
    ipadapter_embeds: String,
    /// Use IPAdapter community loader presets (Composition, Kolors)
    #[arg(long)]
    ipadapter_community: bool,
    /// Community loader preset when --ipadapter-community is used
    #[arg(long, default_value = "Composition")]
    ipadapter_community_preset: String,
    /// Print the generated text without writing the workflow
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
    Config::dotenv_load();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("Error: {}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> AppResult<()> {
    let mut config = Config::new();
    if let Some(path) = cli.pools {
        config.pools_path = path;
    }
    match cli.command {
        Commands::Generate(args) => cmd_generate(&config, args),
        Commands::Apply(args) => cmd_apply(&config, args),
        Commands::List { modes } => cmd_list(&config, modes),
    }
}

fn cmd_generate(config: &Config, args: GenerateArgs) -> AppResult<()> {
    let pool = load_pool(config, &args.prompt)?;
    let options = sample_options(&pool, &args.prompt)?;
    let prompt = sample(&pool, &options)?;
    if !args.flat {
        println!("# CASE prompt");
    }
    for line in prompt.as_lines(args.flat, &args.prompt.delimiter) {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_apply(config: &Config, args: ApplyArgs) -> AppResult<()> {
    let pool = load_pool(config, &args.prompt)?;
    let options = sample_options(&pool, &args.prompt)?;
    let prompt = sample(&pool, &options)?;
    let positive = prompt.positive_block(&args.prompt.delimiter);
    let negative = prompt.negative_line(&args.prompt.delimiter);

    if args.dry_run {
        println!("# Positive Prompt");
        println!("{}", positive);
        println!();
        println!("# Negative Prompt");
        println!("{}", negative);
        return Ok(());
    }

    let text = fs::read_to_string(&args.workflow)
        .map_err(|_| AppError::FileNotFound(args.workflow.clone()))?;
    let document: Value = serde_json::from_str(&text)?;

    let mut session = PatchSession::new(&document)?;
    let text_nodes = TextNodes {
        positive: args.pos_node.clone(),
        negative: args.neg_node.clone(),
    };
    session.inject_prompt_text(&text_nodes, &positive, &negative)?;
    session.apply_overrides(&Overrides {
        lora_strength_model: args.lora_strength_model,
        lora_strength_clip: args.lora_strength_clip,
        clip_stop_layer: args.clip_layer,
    })?;

    let input_dir = config.input_dir_for(&args.workflow);
    if args.add_controlnet {
        session.insert_controlnet(
            &ControlNetArgs {
                model: args.controlnet.clone(),
                image: args.control_image.clone(),
                strength: args.control_strength,
                start: args.control_start,
                end: args.control_end,
            },
            &text_nodes,
            &input_dir,
        )?;
    }
    if args.add_ipadapter {
        session.insert_ipadapter(
            &IpAdapterArgs {
                image: args.ipadapter_image.clone(),
                preset: args.ipadapter_preset.clone(),
                community: args.ipadapter_community,
                community_preset: args.ipadapter_community_preset.clone(),
                weight: args.ipadapter_weight,
                weight_type: args.ipadapter_weight_type.clone(),
                combine_embeds: args.ipadapter_combine.clone(),
                start_at: args.ipadapter_start,
                end_at: args.ipadapter_end,
                embeds_scaling: args.ipadapter_embeds.clone(),
            },
            &input_dir,
        )?;
    }

    let output = args.output.unwrap_or(args.workflow);
    fs::write(&output, serde_json::to_string_pretty(&session.into_value())?)?;
    println!("Updated workflow saved to {}", output.display());
    Ok(())
}

fn cmd_list(config: &Config, modes: Vec<String>) -> AppResult<()> {
    let store = PoolStore::from_path(&config.pools_path)?;
    let mut available = store.mode_names();
    available.sort_unstable();
    println!("modes: {}", available.join(", "));
    let pool = store.merge(&modes)?;
    for section in Section::ALL {
        let mut keys = pool.subcategory_keys(section);
        keys.sort();
        println!("{}: {}", section.key(), keys.join(", "));
    }
    let mut groups: Vec<&str> = pool.negative_group_names();
    groups.sort_unstable();
    println!("negative optional groups: {}", groups.join(", "));
    let mut presets: Vec<&str> = pool.style_preset_names();
    presets.sort_unstable();
    println!("style presets: {}", presets.join(", "));
    Ok(())
}

fn load_pool(config: &Config, flags: &PromptFlags) -> AppResult<MergedPool> {
    let modes = resolve_modes(&flags.modes, flags.mature);
    let store = PoolStore::from_path(&config.pools_path)?;
    store.merge(&modes)
}

fn resolve_modes(modes: &[String], mature: bool) -> Vec<String> {
    let mut modes = modes.to_vec();
    if mature {
        if modes.is_empty() {
            modes.push(DEFAULT_MODE.to_string());
        }
        if !modes.iter().any(|m| m == "mature") {
            modes.push("mature".to_string());
        }
    }
    modes
}

fn sample_options(pool: &MergedPool, flags: &PromptFlags) -> AppResult<SampleOptions> {
    let mut overrides = SectionOverrides::default();
    for (section, raw) in [
        (Section::Composition, &flags.composition),
        (Section::Action, &flags.action),
        (Section::Subject, &flags.subject),
        (Section::Environment, &flags.environment),
    ] {
        let parsed = parse_count_pairs(raw, &pool.subcategory_keys(section))?;
        overrides.set(section, parsed);
    }
    Ok(SampleOptions {
        seed: flags.seed,
        default_count: flags.default_count,
        overrides,
        negative_groups: flags.neg_groups.clone(),
        style_preset: flags.style_preset.clone(),
    })
}
