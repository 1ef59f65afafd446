//! Folding input documents and the MSA files they reference.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use kiln_types::{FoldError, KilnResult};
use serde::Deserialize;
use tracing::debug;

/// `msa` value telling the predictor to run single-sequence mode.
const EMPTY_MSA: &str = "empty";

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    sequences: Vec<BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChainIds {
    One(String),
    Many(Vec<String>),
}

impl ChainIds {
    fn label(&self) -> String {
        match self {
            Self::One(id) => id.clone(),
            Self::Many(ids) => ids.join(","),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProteinEntry {
    id: ChainIds,
    #[serde(default)]
    msa: Option<String>,
}

/// A protein chain's pointer to a precomputed alignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsaRef {
    pub sequence_id: String,
    pub path: PathBuf,
}

/// A predictor input: the YAML text plus the alignment files shipped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldInput {
    yaml: String,
    msa_refs: Vec<MsaRef>,
    /// Relative path -> contents, written beside the input on the worker.
    msa_files: Vec<(PathBuf, Vec<u8>)>,
}

impl FoldInput {
    /// Parse `yaml` and collect its protein MSA references. Referenced files
    /// are not read.
    pub fn parse(yaml: impl Into<String>) -> KilnResult<Self> {
        let yaml = yaml.into();
        let document: Document =
            serde_yaml::from_str(&yaml).map_err(|e| FoldError::InvalidInput {
                message: e.to_string(),
            })?;

        let mut msa_refs = Vec::new();
        for entry in document.sequences {
            let Some(protein) = entry.get("protein") else {
                continue;
            };
            let protein: ProteinEntry =
                serde_yaml::from_value(protein.clone()).map_err(|e| FoldError::InvalidInput {
                    message: format!("protein entry: {e}"),
                })?;
            match protein.msa {
                Some(msa) if msa != EMPTY_MSA => msa_refs.push(MsaRef {
                    sequence_id: protein.id.label(),
                    path: PathBuf::from(msa),
                }),
                _ => {}
            }
        }

        Ok(Self {
            yaml,
            msa_refs,
            msa_files: Vec::new(),
        })
    }

    /// Read and parse the file at `path`, loading every relative MSA reference
    /// from beside it.
    pub fn from_file(path: &Path) -> KilnResult<Self> {
        let mut input = Self::parse(std::fs::read_to_string(path)?)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        for msa in &input.msa_refs {
            if msa.path.is_absolute() {
                // resolves on this machine as-is
                continue;
            }
            if msa.path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(FoldError::InvalidInput {
                    message: format!("MSA path {} leaves the input directory", msa.path.display()),
                }
                .into());
            }
            let source = base.join(&msa.path);
            let contents = std::fs::read(&source).map_err(|_| FoldError::MsaNotFound {
                sequence_id: msa.sequence_id.clone(),
                path: source.display().to_string(),
            })?;
            debug!("Shipping MSA {} ({} bytes)", msa.path.display(), contents.len());
            input.msa_files.push((msa.path.clone(), contents));
        }
        Ok(input)
    }

    pub fn yaml(&self) -> &str {
        &self.yaml
    }

    pub fn msa_refs(&self) -> &[MsaRef] {
        &self.msa_refs
    }

    pub fn msa_files(&self) -> &[(PathBuf, Vec<u8>)] {
        &self.msa_files
    }

    /// Write the document to `dir/file_name` and every shipped MSA beside it.
    pub fn write_to(&self, dir: &Path, file_name: &str) -> KilnResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let input_path = dir.join(file_name);
        std::fs::write(&input_path, &self.yaml)?;
        for (relative, contents) in &self.msa_files {
            let dest = dir.join(relative);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, contents)?;
        }
        Ok(input_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::KilnError;
    use tempfile::tempdir;

    const MULTIMER: &str = r#"
version: 1
sequences:
  - protein:
      id: [A, B]
      sequence: MVTPEGNVSLVDESLLVGVTDEDRAVRSAHQFYERLIGLWAPAVMEAAHELGVFAALAEAPADSGELARRLDCDARAMRVLLDALYAYDVIDRIHDTNGFRYLLSAEARECLLPGTLFSLVGKFMHDINVAWPAWRNLAEVVRHGARDTSGAESPNGIAQEDYESLVGGINFWAPPIVTTLSRKLRASGRSGDATASVLDVGCGTGLYSQLLLREFPRWTATGLDVERIATLANAQALRLGVEERFATRAGDFWRGGWGTGYDLVLFANIFHLQTPASAVRLMRHAAACLAPDGLVAVVDQIVDADREPKTPQDRFALLFAASMTNTGGGDAYTFQEYEEWFTAAGLQRIETLDTPMHRILLARRATEPSAVPEGQASENLYFQ
      msa: ./msa/seq1.a3m
  - protein:
      id: C
      sequence: MKKGHHHHHHGAISLISALVRAHVDSNPAMTSLDYSRFQAN
      msa: empty
  - ligand:
      id: D
      smiles: 'N[C@@H](Cc1ccc(O)cc1)C(=O)O'
"#;

    #[test]
    fn parse_collects_protein_msa_refs() {
        let input = FoldInput::parse(MULTIMER).unwrap();
        assert_eq!(
            input.msa_refs(),
            &[MsaRef {
                sequence_id: "A,B".to_string(),
                path: PathBuf::from("./msa/seq1.a3m"),
            }]
        );
        assert!(input.msa_files().is_empty());
    }

    #[test]
    fn from_file_ships_msa_files() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("msa")).unwrap();
        std::fs::write(dir.path().join("msa/seq1.a3m"), ">101\nMVTPEG\n").unwrap();
        let path = dir.path().join("multimer.yaml");
        std::fs::write(&path, MULTIMER).unwrap();

        let input = FoldInput::from_file(&path).unwrap();
        assert_eq!(input.msa_files().len(), 1);

        let out = tempdir().unwrap();
        let written = input.write_to(out.path(), "input.yaml").unwrap();
        assert_eq!(std::fs::read_to_string(written).unwrap(), MULTIMER);
        assert_eq!(
            std::fs::read(out.path().join("msa/seq1.a3m")).unwrap(),
            b">101\nMVTPEG\n"
        );
    }

    #[test]
    fn missing_msa_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multimer.yaml");
        std::fs::write(&path, MULTIMER).unwrap();

        let err = FoldInput::from_file(&path).unwrap_err();
        assert!(matches!(
            err,
            KilnError::Fold(FoldError::MsaNotFound { ref sequence_id, .. }) if sequence_id == "A,B"
        ));
    }

    #[test]
    fn malformed_yaml_is_invalid_input() {
        let err = FoldInput::parse("sequences: [protein: {id: }").unwrap_err();
        assert!(matches!(err, KilnError::Fold(FoldError::InvalidInput { .. })));
    }

    #[test]
    fn parent_dir_msa_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("in.yaml");
        std::fs::write(
            &path,
            concat!(
                "sequences:\n  - protein:\n      id: A\n",
                "      sequence: MKV\n      msa: ../secret.a3m\n",
            ),
        )
        .unwrap();
        assert!(FoldInput::from_file(&path).is_err());
    }
}
