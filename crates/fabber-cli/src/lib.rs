//! Fabber CLI
//!
//! Command-line driver for the fabber Bayesian model-fitting engine.
//!
//! # Usage
//!
//! ```bash
//! # Fit a quadratic to a 4d timeseries with independent per-voxel VB
//! fabber --model=poly --degree=2 --method=vb --data=data.npy --output=out
//!
//! # Spatially regularised fit restricted to a mask
//! fabber --model=linear --method=spatialvb --data=data.npy --mask=mask.npy \
//!        --output=out --param-spatial-priors=M+
//!
//! # Discover what is available
//! fabber --listmodels
//! fabber --listmethods
//! fabber --help --model=poly
//! ```
//!
//! Options may also be read from files: `-f <file>` takes one
//! `--key=value` per line with `#` comments; `-@ <file>` is the legacy
//! whitespace-separated form.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fabber_core::{core_option_specs, load_voxel_data, FabberError, FabberResult, RunOptions};
use fabber_infer::run::{builtin_methods, write_outputs, CancelToken, RunContext};
use fabber_models::builtin_registry;

/// Engine version reported in the log banner.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Print the top-level usage message, or a plugin's option list when
/// `--model` / `--method` is also given.
fn print_help(options: &RunOptions) -> FabberResult<()> {
    if options.have_key("model") {
        let name = options.get_str("model")?;
        let model = builtin_registry().create(name)?;
        println!("Model: {name}");
        println!("{}", model.description());
        for spec in model.options() {
            print!("{spec}");
        }
        return Ok(());
    }
    if options.have_key("method") {
        let name = options.get_str("method")?;
        let method = builtin_methods().create(name)?;
        println!("Method: {name}");
        println!("{}", method.description());
        for spec in method.options() {
            print!("{spec}");
        }
        return Ok(());
    }
    println!("fabber {VERSION} - Bayesian model fitting for timeseries data");
    println!();
    println!("Usage: fabber --model=<m> --method=<vb|spatialvb> --data=<file> --output=<dir> [options]");
    println!();
    for spec in core_option_specs() {
        print!("{spec}");
    }
    Ok(())
}

/// Initialise tracing with a stdout layer and a `logfile.txt` layer in the
/// output directory.
fn init_logging(output_dir: &Path) -> FabberResult<()> {
    let log_path = output_dir.join("logfile.txt");
    let file = Arc::new(
        File::create(&log_path).map_err(|e| FabberError::data_load(&log_path, e.to_string()))?,
    );
    let result = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(move || Arc::clone(&file)),
        )
        .try_init();
    // A second run in the same process keeps the original subscriber
    drop(result);
    Ok(())
}

/// Parse arguments and execute a full fabber run.
///
/// Returns the process exit code: 0 on success, 1 if any voxel failed.
pub fn run_app(args: &[String]) -> FabberResult<i32> {
    let options = RunOptions::parse_args(args)?;

    if options.get_bool("help")? || args.is_empty() {
        print_help(&options)?;
        return Ok(0);
    }
    if options.get_bool("listmodels")? {
        for name in builtin_registry().names() {
            println!("{name}");
        }
        return Ok(0);
    }
    if options.get_bool("listmethods")? {
        for name in builtin_methods().names() {
            println!("{name}");
        }
        return Ok(0);
    }
    if options.have_key("loadmodels") {
        return Err(FabberError::invalid_option(
            "loadmodels",
            options.get_str_default("loadmodels", ""),
            "dynamic model loading is not available in this build; \
             models are registered at compile time",
        ));
    }

    let output_dir = options.resolve_output_dir()?;
    init_logging(&output_dir)?;

    let start = Instant::now();
    info!("fabber release v{VERSION}");
    info!("Start time: {}", chrono::Local::now().to_rfc2822());
    for (key, value) in options.iter() {
        if value.is_empty() {
            info!("Parameter {key}");
        } else {
            info!("Parameter {key}={value}");
        }
    }

    let data = load_voxel_data(&options)?;
    info!(
        "Num voxels {} with {} timepoints",
        data.n_voxels(),
        data.n_timepoints()
    );

    let model_name = options.get_str("model")?.to_string();
    let mut model = builtin_registry().create(&model_name)?;
    model.initialize(&options, data.n_timepoints())?;
    info!("Forward model: {model_name} ({})", model.description());

    let method_name = options.get_str("method")?.to_string();
    let mut method = builtin_methods().create(&method_name)?;
    info!("Inference method: {method_name}");

    let flags = options.save_flags()?;
    let ctx = RunContext {
        options,
        data,
        model,
        cancel: CancelToken::new(),
    };

    let outputs = method.run(&ctx)?;

    info!("Saving results to {}", output_dir.display());
    write_outputs(&output_dir, &outputs, &ctx.data, &flags)?;

    let n_failed = outputs.failed.len();
    let elapsed = start.elapsed();
    info!(
        "All done. {} voxels, {} failed, {:.1}s",
        ctx.data.n_voxels(),
        n_failed,
        elapsed.as_secs_f64()
    );
    println!(
        "Done: {} voxels ({} failed) -> {}",
        ctx.data.n_voxels(),
        n_failed,
        output_dir.display()
    );

    Ok(if n_failed > 0 { 1 } else { 0 })
}
