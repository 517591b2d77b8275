use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The C library a system or package set is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibcVariant {
    Musl,
    Glibc,
}

impl LibcVariant {
    pub const ALL: [LibcVariant; 2] = [LibcVariant::Musl, LibcVariant::Glibc];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Musl => "musl",
            Self::Glibc => "glibc",
        }
    }
}

impl fmt::Display for LibcVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LibcVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "musl" => Ok(Self::Musl),
            "glibc" => Ok(Self::Glibc),
            other => Err(format!("unknown libc variant '{other}' (expected musl or glibc)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        for v in LibcVariant::ALL {
            let json = serde_json::to_string(&v).unwrap();
            assert_eq!(json, format!("\"{v}\""));
            assert_eq!(v.as_str().parse::<LibcVariant>().unwrap(), v);
        }
    }

    #[test]
    fn rejects_unknown_variant() {
        assert!("uclibc".parse::<LibcVariant>().is_err());
        assert!("Musl".parse::<LibcVariant>().is_err());
    }
}
