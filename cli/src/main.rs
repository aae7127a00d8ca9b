#[macro_use]
extern crate log;

use std::process;

use anyhow::Context;
use clap::{Arg, ArgMatches, Command, crate_version};
use efficientnet_lite::blocks::{HEAD_FILTERS, STEM_FILTERS, blocks};
use efficientnet_lite::prelude::*;
use efficientnet_lite::tract_nnef::internal::*;

mod params;

fn main() {
    let model_args = params::model_args();

    let variants = Command::new("variants").about("List variants and their scaling parameters");

    let classify = Command::new("classify")
        .about("Classify an image")
        .arg(Arg::new("image").required(true).help("Image file to classify"))
        .args(model_args.clone())
        .arg(params::normalization_arg("symmetric"))
        .arg(Arg::new("labels").long("labels").takes_value(true).help("Labels file, one per line"))
        .arg(
            Arg::new("top")
                .long("top")
                .short('k')
                .takes_value(true)
                .default_value("5")
                .help("Number of classes to show"),
        );

    let check = Command::new("check")
        .about("Run an image and compare the output with a reference .npy array")
        .arg(Arg::new("image").required(true).help("Image file to run"))
        .arg(
            Arg::new("reference")
                .long("reference")
                .takes_value(true)
                .required(true)
                .help("Expected output (.npy)"),
        )
        .args(model_args.clone())
        .arg(params::normalization_arg("centered"))
        .arg(
            Arg::new("atol")
                .long("atol")
                .takes_value(true)
                .help("Absolute tolerance [default: 5e-4]"),
        )
        .arg(
            Arg::new("rtol")
                .long("rtol")
                .takes_value(true)
                .help("Relative tolerance [default: 1e-4]"),
        )
        .arg(Arg::new("strict").long("strict").help("Use a ten epsilons tolerance"));

    let export = Command::new("export")
        .about("Write the generated network as an NNEF tar archive")
        .arg(Arg::new("output").required(true).help("Destination .nnef.tar file"))
        .args(model_args);

    let app = Command::new("efficientnet-lite")
        .version(crate_version!())
        .about("EfficientNet-Lite image classification on tract")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbosity")
                .short('v')
                .multiple_occurrences(true)
                .help("Sets the level of verbosity."),
        )
        .subcommand(variants)
        .subcommand(classify)
        .subcommand(check)
        .subcommand(export);

    let matches = app.get_matches();

    let level = match matches.occurrences_of("verbosity") {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level);
    env_logger::Builder::from_env(env).format_timestamp_nanos().init();

    if let Err(e) = handle(matches) {
        error!("{e:?}");
        process::exit(1)
    }
}

fn handle(matches: ArgMatches) -> TractResult<()> {
    match matches.subcommand() {
        Some(("variants", _)) => variants(),
        Some(("classify", m)) => classify(m),
        Some(("check", m)) => check(m),
        Some(("export", m)) => export(m),
        Some((other, _)) => bail!("Unknown subcommand {}", other),
        None => bail!("No subcommand given"),
    }
}

fn variants() -> TractResult<()> {
    println!(
        "{:<20} {:>10} {:>6} {:>6} {:>7} {:>6} {:>6}",
        "model", "resolution", "width", "depth", "dropout", "blocks", "stem"
    );
    for variant in Variant::ALL {
        let p = variant.params();
        println!(
            "{:<20} {:>10} {:>6} {:>6} {:>7} {:>6} {:>6}",
            variant.model_name(),
            p.resolution,
            p.width,
            p.depth,
            p.dropout,
            blocks(variant).len(),
            STEM_FILTERS,
        );
    }
    println!("head filters: {HEAD_FILTERS}");
    Ok(())
}

fn classify(matches: &ArgMatches) -> TractResult<()> {
    let config = params::model_config(matches)?;
    let normalization = params::normalization(matches)?;
    let top: usize = matches
        .value_of("top")
        .unwrap_or("5")
        .parse()
        .map_err(|e| format_err!("Invalid --top: {}", e))?;
    let image = matches.value_of("image").context("Missing image")?;
    let model = EfficientNetLite::new(config)?;
    let mut predictions = model.predict(image, normalization, top)?;
    if let Some(labels) = matches.value_of("labels") {
        predictions = with_labels(predictions, &load_labels(labels)?);
    }
    for prediction in predictions {
        println!("{prediction}");
    }
    Ok(())
}

fn tolerance(matches: &ArgMatches) -> TractResult<Tolerance> {
    let mut tolerance =
        if matches.is_present("strict") { Tolerance::strict() } else { Tolerance::default() };
    if let Some(atol) = matches.value_of("atol") {
        tolerance.atol = atol.parse().map_err(|e| format_err!("Invalid --atol: {}", e))?;
    }
    if let Some(rtol) = matches.value_of("rtol") {
        tolerance.rtol = rtol.parse().map_err(|e| format_err!("Invalid --rtol: {}", e))?;
    }
    Ok(tolerance)
}

fn check(matches: &ArgMatches) -> TractResult<()> {
    let config = params::model_config(matches)?;
    let normalization = params::normalization(matches)?;
    let tolerance = tolerance(matches)?;
    let image = load_image(matches.value_of("image").context("Missing image")?)?;
    let reference = load_reference(matches.value_of("reference").context("Missing reference")?)?;
    let model = EfficientNetLite::new(config)?;
    let output = model.run_image(&image, normalization)?;
    tolerance.check(&output, &reference).context("Output does not match reference")?;
    info!("{} output {:?} matches reference", model.variant(), output.shape());
    println!("ok");
    Ok(())
}

fn export(matches: &ArgMatches) -> TractResult<()> {
    let config = params::model_config(matches)?;
    let output = matches.value_of("output").context("Missing output path")?;
    let archive = EfficientNetLite::nnef_archive(&config)?;
    fs_err::write(output, &archive)?;
    info!("Wrote {} ({} bytes) to {}", config.variant, archive.len(), output);
    Ok(())
}
