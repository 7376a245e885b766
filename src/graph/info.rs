use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// What a persisted record describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    /// The command used to compile a source file.
    Command,
    /// An explicitly built module, written to `output_path`.
    Module { output_path: Utf8PathBuf },
}

/// One compiler invocation of a translation unit or module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileCommand {
    /// Cache key of the invocation, when compilation caching is enabled.
    pub cache_key: Option<String>,
    pub arguments: Vec<String>,
}

/// File and module dependencies of a single translation unit or module, as
/// persisted next to the module outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfo {
    pub kind: DependencyKind,
    pub files: IndexSet<Utf8PathBuf>,
    pub include_tree_id: Option<String>,
    /// Module dependencies as paths of their built modules.
    pub modules: IndexSet<Utf8PathBuf>,
    pub working_directory: Utf8PathBuf,
    /// A single driver invocation can expand to several jobs, e.g. with
    /// `-save-temps`, so a command record may carry more than one command.
    pub commands: Vec<CompileCommand>,
    pub transitive_include_tree_ids: IndexSet<String>,
    pub transitive_cache_keys: IndexSet<String>,
    pub uses_serialized_diagnostics: bool,
}

impl DependencyInfo {
    /// Output path of the module, `None` for command records.
    pub fn output_path(&self) -> Option<&Utf8Path> {
        match &self.kind {
            DependencyKind::Module { output_path } => Some(output_path),
            DependencyKind::Command => None,
        }
    }

    /// The only command of the record, if there is exactly one.
    pub fn only_command(&self) -> Option<&CompileCommand> {
        match self.commands.as_slice() {
            [command] => Some(command),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ciborium::ser::Error<std::io::Error>> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(buffer)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::from_reader(bytes)
    }
}

/// Accumulates the transitive include-tree and cache-key sets of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Transitive {
    pub include_tree_ids: IndexSet<String>,
    pub cache_keys: IndexSet<String>,
}

impl Transitive {
    pub fn extend(&mut self, other: &Transitive) {
        self.include_tree_ids
            .extend(other.include_tree_ids.iter().cloned());
        self.cache_keys.extend(other.cache_keys.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: DependencyKind) -> DependencyInfo {
        DependencyInfo {
            kind,
            files: ["/src/a.h", "/src/b.h"].into_iter().map(Utf8PathBuf::from).collect(),
            include_tree_id: Some("llvmcas://tree".into()),
            modules: [Utf8PathBuf::from("/out/B-2.pcm")].into_iter().collect(),
            working_directory: "/".into(),
            commands: vec![CompileCommand {
                cache_key: Some("key-a".into()),
                arguments: vec!["clang".into(), "-fmodules".into()],
            }],
            transitive_include_tree_ids: ["llvmcas://tree".to_string()].into_iter().collect(),
            transitive_cache_keys: ["key-a".to_string(), "key-b".to_string()]
                .into_iter()
                .collect(),
            uses_serialized_diagnostics: true,
        }
    }

    #[test]
    fn test_record_survives_encoding() {
        let info = sample(DependencyKind::Module {
            output_path: "/out/A-1.pcm".into(),
        });

        let bytes = info.encode().unwrap();
        let back = DependencyInfo::decode(&bytes).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.output_path(), Some(Utf8Path::new("/out/A-1.pcm")));
    }

    #[test]
    fn test_command_kind_is_accepted() {
        let mut info = sample(DependencyKind::Command);
        info.commands.push(CompileCommand {
            cache_key: None,
            arguments: vec!["ld".into()],
        });

        let back = DependencyInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(back.kind, DependencyKind::Command);
        assert!(back.output_path().is_none());
        assert!(back.only_command().is_none());
    }

    #[test]
    fn test_set_order_is_preserved() {
        let mut info = sample(DependencyKind::Command);
        info.files = ["/z", "/a", "/m"].into_iter().map(Utf8PathBuf::from).collect();

        let back = DependencyInfo::decode(&info.encode().unwrap()).unwrap();
        let files: Vec<_> = back.files.iter().map(|p| p.as_str()).collect();
        assert_eq!(files, ["/z", "/a", "/m"]);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(DependencyInfo::decode(b"\xff\x00 not cbor").is_err());
    }
}
