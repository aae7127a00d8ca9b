use std::path;
use std::sync::OnceLock;

use anyhow::Context;
use efficientnet_lite::prelude::*;
use efficientnet_lite::tract_nnef::internal::*;
use image::RgbImage;
use log::info;

/// The reference outputs were produced from `(x - 127) / 128` inputs.
pub const NORMALIZATION: Normalization = Normalization::Centered;

/// Runs `./download.sh` once per process. It provisions the sample image, the
/// reference arrays and the converted ImageNet weights in [cachedir].
pub fn download() -> TractResult<()> {
    static DOWNLOAD: OnceLock<Result<(), String>> = OnceLock::new();
    DOWNLOAD
        .get_or_init(|| do_download().map_err(|e| format!("{e:?}")))
        .clone()
        .map_err(|e| format_err!("{}", e))
}

fn do_download() -> TractResult<()> {
    run_script(path::Path::new("./download.sh"))
}

fn run_script(script: &path::Path) -> TractResult<()> {
    let status = std::process::Command::new(script)
        .env("CACHEDIR", cachedir().parent().unwrap_or(path::Path::new(".")))
        .status()
        .with_context(|| format!("Running {script:?}"))?;
    if !status.success() {
        bail!("Failed to download model files ({script:?}: {status})")
    }
    Ok(())
}

pub fn cachedir() -> path::PathBuf {
    let root: path::PathBuf =
        std::env::var("CACHEDIR").ok().unwrap_or_else(|| "../../.cached".to_string()).into();
    root.join("efficientnet-lite")
}

pub fn sample_image() -> path::PathBuf {
    cachedir().join("panda.jpg")
}

/// The decoded sample image, shared by every case.
pub fn sample() -> TractResult<&'static RgbImage> {
    static SAMPLE: OnceLock<RgbImage> = OnceLock::new();
    download()?;
    decode_once(&SAMPLE, sample_image())
}

fn decode_once(
    cell: &'static OnceLock<RgbImage>,
    path: impl AsRef<path::Path>,
) -> TractResult<&'static RgbImage> {
    if let Some(image) = cell.get() {
        return Ok(image);
    }
    let image = load_image(path)?;
    Ok(cell.get_or_init(|| image))
}

/// One variant at its native resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Case {
    pub variant: Variant,
}

pub const CASES: [Case; 5] = [
    Case { variant: Variant::B0 },
    Case { variant: Variant::B1 },
    Case { variant: Variant::B2 },
    Case { variant: Variant::B3 },
    Case { variant: Variant::B4 },
];

impl Case {
    pub fn resolution(&self) -> usize {
        self.variant.resolution()
    }

    pub fn reference_file_name(&self) -> String {
        format!("{}_lite_output_{}.npy", self.variant.name(), self.resolution())
    }

    pub fn reference(&self) -> path::PathBuf {
        cachedir().join(self.reference_file_name())
    }

    /// ImageNet weights, converted by `download.sh` next to the fixtures.
    pub fn weights(&self) -> Weights {
        Weights::File(cachedir().join(self.variant.weights_file_name()))
    }

    pub fn config(&self, weights: Weights) -> ModelConfig {
        let side = self.resolution();
        ModelConfig::new(self.variant).with_weights(weights).with_input_size(side, side)
    }

    /// Runs `image` through a freshly built pretrained model and compares
    /// against the stored reference.
    pub fn check(&self, image: &RgbImage, tolerance: Tolerance) -> TractResult<Tensor> {
        download()?;
        check_output(self.config(self.weights()), image, self.reference(), tolerance)
    }
}

/// Checks every case against the sample image, decoded once.
pub fn check_all(tolerance: Tolerance) -> TractResult<Vec<Tensor>> {
    let image = sample()?;
    CASES.iter().map(|case| case.check(image, tolerance)).collect()
}

/// Builds the model for `config`, runs `image` and checks the output against
/// the `.npy` array at `reference`. Returns the output on success.
pub fn check_output(
    config: ModelConfig,
    image: &RgbImage,
    reference: impl AsRef<path::Path>,
    tolerance: Tolerance,
) -> TractResult<Tensor> {
    let reference = reference.as_ref();
    let expected = load_reference(reference)?;
    let model = EfficientNetLite::new(config)?;
    let output = model.run_image(image, NORMALIZATION)?;
    tolerance
        .check(&output, &expected)
        .map_err(|e| e.context(format!("{} against {:?}", model.variant(), reference)))?;
    info!("{} matches {:?}", model.variant(), reference);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use efficientnet_lite::tract_nnef::prelude::tract_ndarray::{ArrayD, IxDyn, s};

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    macro_rules! fixture_case {
        ($name: ident, $variant: expr) => {
            #[test]
            #[ignore]
            fn $name() -> TractResult<()> {
                setup();
                let case = Case { variant: $variant };
                case.check(sample()?, Tolerance::default())?;
                Ok(())
            }
        };
    }

    fixture_case!(b0, Variant::B0);
    fixture_case!(b1, Variant::B1);
    fixture_case!(b2, Variant::B2);
    fixture_case!(b3, Variant::B3);
    fixture_case!(b4, Variant::B4);

    #[test]
    #[ignore]
    fn b0_classifies_panda() -> TractResult<()> {
        setup();
        let output = CASES[0].check(sample()?, Tolerance::default())?;
        assert_eq!(output.shape(), &[1, 1000]);
        let again = CASES[0].check(sample()?, Tolerance::default())?;
        assert_eq!(output, again);
        Ok(())
    }

    #[test]
    #[ignore]
    fn all_cases() -> TractResult<()> {
        setup();
        let outputs = check_all(Tolerance::default())?;
        assert!(outputs.iter().all(|o| o.shape() == [1, 1000]));
        Ok(())
    }

    #[test]
    fn image_is_decoded_once() -> TractResult<()> {
        static IMAGE: OnceLock<RgbImage> = OnceLock::new();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("once.png");
        RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3])).save(&path)?;
        let first = decode_once(&IMAGE, &path)?;
        std::fs::remove_file(&path)?;
        let second = decode_once(&IMAGE, &path)?;
        assert!(std::ptr::eq(first, second));
        assert_eq!(second.get_pixel(7, 7), &image::Rgb([1, 2, 3]));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn download_script_status() -> TractResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir()?;
        let script = |name: &str, body: &str| -> TractResult<path::PathBuf> {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
            Ok(path)
        };
        run_script(&script("ok.sh", "exit 0")?)?;
        let err = run_script(&script("fail.sh", "exit 3")?).unwrap_err();
        assert!(err.to_string().contains("Failed to download"), "{err}");
        assert!(run_script(&dir.path().join("absent.sh")).is_err());
        Ok(())
    }

    #[test]
    fn reference_names() {
        let names: Vec<String> = CASES.iter().map(|c| c.reference_file_name()).collect();
        assert_eq!(
            names,
            vec![
                "b0_lite_output_224.npy",
                "b1_lite_output_240.npy",
                "b2_lite_output_260.npy",
                "b3_lite_output_280.npy",
                "b4_lite_output_300.npy",
            ]
        );
        assert!(CASES[4].reference().ends_with("efficientnet-lite/b4_lite_output_300.npy"));
    }

    struct Synthetic {
        _dir: tempfile::TempDir,
        config: ModelConfig,
        image: RgbImage,
        reference: path::PathBuf,
        expected: ArrayD<f32>,
    }

    impl Synthetic {
        fn check(&self, reference: &path::Path, tolerance: Tolerance) -> TractResult<Tensor> {
            check_output(self.config.clone(), &self.image, reference, tolerance)
        }
    }

    /// Small random-weight model with a reference produced by a first run.
    fn synthetic() -> TractResult<Synthetic> {
        setup();
        let dir = tempfile::tempdir()?;
        let image =
            RgbImage::from_fn(80, 60, |x, y| image::Rgb([(x * 3) as u8, (y * 4) as u8, 90]));
        let config = ModelConfig::new(Variant::B0)
            .with_weights(Weights::Random { seed: 11 })
            .with_input_size(64, 64);
        let model = EfficientNetLite::new(config.clone())?;
        let output = model.run_image(&image, NORMALIZATION)?;
        let expected = output.to_array_view::<f32>()?.to_owned();
        let reference = dir.path().join("reference.npy");
        ndarray_npy::write_npy(&reference, &expected)?;
        Ok(Synthetic { _dir: dir, config, image, reference, expected })
    }

    #[test]
    fn matching_reference_passes() -> TractResult<()> {
        let fixture = synthetic()?;
        let output = fixture.check(&fixture.reference, Tolerance::default())?;
        assert_eq!(output.shape(), &[1, 1000]);
        // a fresh model gives the exact same values
        fixture.check(&fixture.reference, Tolerance::strict())?;
        Ok(())
    }

    #[test]
    fn perturbed_reference_fails() -> TractResult<()> {
        let fixture = synthetic()?;
        let mut perturbed = fixture.expected.clone();
        perturbed[IxDyn(&[0, 7])] += 0.1;
        ndarray_npy::write_npy(&fixture.reference, &perturbed)?;
        let err = fixture.check(&fixture.reference, Tolerance::default()).unwrap_err();
        let message = format!("{err:?}");
        assert!(message.contains("1 of 1000 values"), "{message}");
        assert!(message.contains("[0, 7]"), "{message}");
        Ok(())
    }

    #[test]
    fn wrong_shape_reference_fails() -> TractResult<()> {
        let fixture = synthetic()?;
        let truncated = fixture.expected.slice(s![.., ..999]).to_owned();
        ndarray_npy::write_npy(&fixture.reference, &truncated)?;
        assert!(fixture.check(&fixture.reference, Tolerance::default()).is_err());
        Ok(())
    }

    #[test]
    fn missing_reference_fails() -> TractResult<()> {
        let fixture = synthetic()?;
        let missing = fixture.reference.with_file_name("absent.npy");
        let err = fixture.check(&missing, Tolerance::default()).unwrap_err();
        assert!(err.to_string().contains("not found"));
        Ok(())
    }
}
