use std::fmt;
use std::str::FromStr;

use tract_nnef::internal::*;

/// The five EfficientNet-Lite scaling configurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variant {
    B0,
    B1,
    B2,
    B3,
    B4,
}

/// Compound scaling coefficients of a variant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalingParams {
    pub width: f64,
    pub depth: f64,
    pub resolution: usize,
    pub dropout: f32,
}

impl Variant {
    pub const ALL: [Variant; 5] = [Variant::B0, Variant::B1, Variant::B2, Variant::B3, Variant::B4];

    pub fn params(&self) -> ScalingParams {
        let (width, depth, resolution, dropout) = match self {
            Variant::B0 => (1.0, 1.0, 224, 0.2),
            Variant::B1 => (1.0, 1.1, 240, 0.2),
            Variant::B2 => (1.1, 1.2, 260, 0.3),
            Variant::B3 => (1.2, 1.4, 280, 0.3),
            Variant::B4 => (1.4, 1.8, 300, 0.3),
        };
        ScalingParams { width, depth, resolution, dropout }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Short name, as used for test cases and command line flags: `b0`..`b4`.
    pub fn name(&self) -> &'static str {
        ["b0", "b1", "b2", "b3", "b4"][self.index()]
    }

    /// Canonical model name: `efficientnet-lite0`..`efficientnet-lite4`.
    pub fn model_name(&self) -> &'static str {
        [
            "efficientnet-lite0",
            "efficientnet-lite1",
            "efficientnet-lite2",
            "efficientnet-lite3",
            "efficientnet-lite4",
        ][self.index()]
    }

    pub fn resolution(&self) -> usize {
        self.params().resolution
    }

    /// Native (height, width) input size.
    pub fn input_size(&self) -> (usize, usize) {
        (self.resolution(), self.resolution())
    }

    pub fn weights_file_name(&self) -> String {
        format!("{}.npz", self.model_name())
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.model_name())
    }
}

impl FromStr for Variant {
    type Err = TractError;

    fn from_str(s: &str) -> TractResult<Variant> {
        let lower = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        let digit = ["efficientnet-lite-", "efficientnet-lite", "efficientnetlite", "lite", "b"]
            .iter()
            .find_map(|prefix| lower.strip_prefix(prefix))
            .unwrap_or(&lower);
        match digit {
            "0" => Ok(Variant::B0),
            "1" => Ok(Variant::B1),
            "2" => Ok(Variant::B2),
            "3" => Ok(Variant::B3),
            "4" => Ok(Variant::B4),
            _ => bail!("Unknown EfficientNet-Lite variant `{}' (expected b0 to b4)", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolutions() {
        let res: Vec<usize> = Variant::ALL.iter().map(|v| v.resolution()).collect();
        assert_eq!(res, vec![224, 240, 260, 280, 300]);
    }

    #[test]
    fn parse_names() -> TractResult<()> {
        assert_eq!("b0".parse::<Variant>()?, Variant::B0);
        assert_eq!("B3".parse::<Variant>()?, Variant::B3);
        assert_eq!("lite2".parse::<Variant>()?, Variant::B2);
        assert_eq!("efficientnet-lite4".parse::<Variant>()?, Variant::B4);
        assert_eq!("EfficientNet_Lite1".parse::<Variant>()?, Variant::B1);
        assert!("b5".parse::<Variant>().is_err());
        assert!("".parse::<Variant>().is_err());
        Ok(())
    }

    #[test]
    fn display_round_trips() -> TractResult<()> {
        for v in Variant::ALL {
            assert_eq!(v.to_string().parse::<Variant>()?, v);
            assert_eq!(v.name().parse::<Variant>()?, v);
        }
        Ok(())
    }
}
