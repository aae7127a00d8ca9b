use clap::{Arg, ArgMatches};
use efficientnet_lite::prelude::*;
use efficientnet_lite::tract_nnef::internal::*;
use log::debug;

/// Flags shared by every subcommand that builds a model.
pub fn model_args() -> Vec<Arg<'static>> {
    vec![
        Arg::new("variant")
            .long("variant")
            .short('m')
            .takes_value(true)
            .default_value("b0")
            .help("Model variant, b0 to b4"),
        Arg::new("weights")
            .long("weights")
            .takes_value(true)
            .default_value("imagenet")
            .help("imagenet, random, random:SEED, or a Keras-named .npz archive"),
        Arg::new("seed")
            .long("seed")
            .takes_value(true)
            .help("Seed for random weights (implies --weights random)"),
        Arg::new("input-size")
            .long("input-size")
            .takes_value(true)
            .help("Input size as HxW or a single side [default: variant resolution]"),
        Arg::new("classes")
            .long("classes")
            .takes_value(true)
            .help("Number of classes of the classifier [default: 1000]"),
        Arg::new("no-top").long("no-top").help("Leave the classifier out, output features"),
        Arg::new("pooling")
            .long("pooling")
            .takes_value(true)
            .possible_values(["avg", "max"])
            .requires("no-top")
            .help("Global pooling of the features"),
        Arg::new("logits").long("logits").help("Output logits instead of probabilities"),
    ]
}

pub fn normalization_arg(default: &'static str) -> Arg<'static> {
    Arg::new("normalization")
        .long("normalization")
        .takes_value(true)
        .possible_values(["symmetric", "centered"])
        .default_value(default)
        .help("Pixel normalization: x/127.5-1 (symmetric) or (x-127)/128 (centered)")
}

pub fn normalization(matches: &ArgMatches) -> TractResult<Normalization> {
    matches.value_of("normalization").unwrap_or("symmetric").parse()
}

fn parse_size(s: &str) -> TractResult<(usize, usize)> {
    let parsed = match s.split_once('x') {
        Some((h, w)) => h.trim().parse().and_then(|h| Ok((h, w.trim().parse()?))),
        None => s.trim().parse().map(|side| (side, side)),
    };
    parsed.map_err(|e| format_err!("Invalid input size {:?}: {}", s, e))
}

pub fn model_config(matches: &ArgMatches) -> TractResult<ModelConfig> {
    let variant: Variant = matches.value_of("variant").unwrap_or("b0").parse()?;
    let weights = if let Some(seed) = matches.value_of("seed") {
        let seed = seed.parse().map_err(|e| format_err!("Invalid seed {:?}: {}", seed, e))?;
        Weights::Random { seed }
    } else {
        matches.value_of("weights").unwrap_or("imagenet").parse()?
    };
    let mut config = ModelConfig::new(variant).with_weights(weights);
    if let Some(size) = matches.value_of("input-size") {
        let (h, w) = parse_size(size)?;
        config = config.with_input_size(h, w);
    }
    if let Some(classes) = matches.value_of("classes") {
        let classes =
            classes.parse().map_err(|e| format_err!("Invalid class count {:?}: {}", classes, e))?;
        config = config.with_classes(classes);
    }
    if matches.is_present("no-top") {
        let pooling = match matches.value_of("pooling") {
            Some("avg") => Some(Pooling::Avg),
            Some("max") => Some(Pooling::Max),
            _ => None,
        };
        config = config.without_top(pooling);
    }
    if matches.is_present("logits") {
        config = config.with_classifier_activation(ClassifierActivation::Linear);
    }
    debug!("Model configuration: {:?}", config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(parse_size("224").unwrap(), (224, 224));
        assert_eq!(parse_size("96x128").unwrap(), (96, 128));
        assert!(parse_size("96x").is_err());
        assert!(parse_size("big").is_err());
    }

    #[test]
    fn config_from_flags() {
        let cmd = clap::Command::new("test").args(model_args());
        let matches = cmd
            .clone()
            .get_matches_from(["test", "-m", "lite2", "--seed", "7", "--input-size", "64"]);
        let config = model_config(&matches).unwrap();
        assert_eq!(config.variant, Variant::B2);
        assert_eq!(config.weights, Weights::Random { seed: 7 });
        assert_eq!(config.input_shape(), [1, 64, 64, 3]);

        let matches =
            cmd.get_matches_from(["test", "--weights", "w.npz", "--no-top", "--pooling", "max"]);
        let config = model_config(&matches).unwrap();
        assert_eq!(config.weights, Weights::File("w.npz".into()));
        assert!(!config.include_top);
        assert_eq!(config.pooling, Some(Pooling::Max));
    }
}
