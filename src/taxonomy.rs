use anyhow::bail;
use std::str::FromStr;

/// Report category an image tag is filed under, e.g. `universe-devel-cuda`.
pub type ImageCategory = String;

/// A named tag family and the modifiers it distinguishes.
#[derive(Debug, Clone, Copy)]
struct FamilyRule {
    family: &'static str,
    modifiers: &'static [&'static str],
}

/// Universe image families, most specific first. A family that is a
/// substring of another family must come after it.
const UNIVERSE_RULES: &[FamilyRule] = &[
    FamilyRule {
        family: "universe-sensing-perception",
        modifiers: &["devel", "cuda"],
    },
    FamilyRule {
        family: "universe-localization-mapping",
        modifiers: &["devel", "cuda"],
    },
    FamilyRule {
        family: "universe-planning-control",
        modifiers: &["devel", "cuda"],
    },
    FamilyRule {
        family: "universe-vehicle-system",
        modifiers: &["devel", "cuda"],
    },
    FamilyRule {
        family: "universe",
        modifiers: &["common", "devel", "cuda"],
    },
    FamilyRule {
        family: "core",
        modifiers: &["common", "devel", "cuda"],
    },
];

/// CUDA image stages, in precedence order.
const CUDA_STAGES: &[&str] = &["prebuilt", "devel", "runtime"];
const CUDA_ARCHES: &[&str] = &["amd64", "arm64"];

/// Maps image tags to report categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Taxonomy {
    /// `universe-*` / `core-*` families with `-common`/`-devel`/`-cuda`
    /// modifiers.
    Universe,
    /// Arch-suffixed CUDA images: `<stage>-cuda-<arch>`.
    CudaRuntime,
}

impl FromStr for Taxonomy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "universe" => Ok(Taxonomy::Universe),
            "cuda-runtime" => Ok(Taxonomy::CudaRuntime),
            other => bail!("unknown taxonomy {other:?} (expected \"universe\" or \"cuda-runtime\")"),
        }
    }
}

impl Taxonomy {
    /// Category of `tag`, or `None` when no rule matches. First match wins.
    pub fn classify(self, tag: &str) -> Option<ImageCategory> {
        match self {
            Taxonomy::Universe => classify_universe(tag),
            Taxonomy::CudaRuntime => classify_cuda_runtime(tag),
        }
    }

    /// Every category the report carries a series for, in display order.
    /// Categories produced by `classify` but missing here are not reported.
    pub fn categories(self) -> Vec<ImageCategory> {
        let names: &[&str] = match self {
            Taxonomy::Universe => &[
                "core-common-devel",
                "core-devel",
                "core",
                "universe-common-devel",
                "universe-sensing-perception-devel",
                "universe-sensing-perception-devel-cuda",
                "universe-localization-mapping-devel",
                "universe-planning-control-devel",
                "universe-vehicle-system-devel",
                "universe-sensing-perception",
                "universe-sensing-perception-cuda",
                "universe-localization-mapping",
                "universe-planning-control",
                "universe-vehicle-system",
                "universe-devel",
                "universe-devel-cuda",
                "universe",
                "universe-cuda",
            ],
            Taxonomy::CudaRuntime => &[
                "prebuilt-cuda-amd64",
                "devel-cuda-amd64",
                "runtime-cuda-amd64",
                "prebuilt-cuda-arm64",
                "devel-cuda-arm64",
                "runtime-cuda-arm64",
            ],
        };
        names.iter().map(|n| n.to_string()).collect()
    }
}

fn classify_universe(tag: &str) -> Option<ImageCategory> {
    let rule = UNIVERSE_RULES.iter().find(|r| tag.contains(r.family))?;
    let mut category = rule.family.to_string();
    for modifier in rule.modifiers {
        if tag.contains(modifier) {
            category.push('-');
            category.push_str(modifier);
        }
    }
    Some(category)
}

fn classify_cuda_runtime(tag: &str) -> Option<ImageCategory> {
    let arch = CUDA_ARCHES.iter().find(|a| tag.ends_with(*a))?;
    if !tag.contains("cuda") {
        return None;
    }
    let stage = CUDA_STAGES.iter().find(|s| tag.contains(*s))?;
    Some(format!("{stage}-cuda-{arch}"))
}
