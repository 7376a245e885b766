use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::{ReportError, StoreError};
use crate::graph::info::DependencyInfo;
use crate::graph::store::read_record;

/// Reads every record in `paths` in parallel.
pub fn load_records(paths: &[Utf8PathBuf]) -> Result<Vec<DependencyInfo>, StoreError> {
    paths.par_iter().map(|path| read_record(path)).collect()
}

/// Writes a drift report of the module records among `records` into
/// `directory`: a `Summary.csv` listing how many variants of each module were
/// built, and one `<Module>.csv` per module showing which command line
/// arguments each variant was built with. Returns a human readable summary.
pub fn write_precompiled_modules_report(
    records: Vec<DependencyInfo>,
    directory: &Utf8Path,
) -> Result<String, ReportError> {
    let mut by_module = BTreeMap::<String, Vec<DependencyInfo>>::new();
    for record in records {
        let Some(name) = record.output_path().and_then(module_name) else {
            continue;
        };
        by_module.entry(name).or_default().push(record);
    }

    fs::create_dir_all(directory).map_err(|source| ReportError::Io {
        path: directory.to_owned(),
        source,
    })?;

    let mut summary = Csv::default();
    let mut message = String::new();
    summary.row(["Name", "Variants"]);

    for (name, mut variants) in by_module {
        variants.sort_by(|a, b| a.output_path().cmp(&b.output_path()));
        variants.dedup();

        let count = variants.len();
        summary.row([name.clone(), count.to_string()]);
        let noun = if count == 1 { "variant" } else { "variants" };
        writeln!(message, "{name}: {count} {noun}").ok();

        let drift = drifting_tokens(&variants);

        let mut csv = Csv::default();
        csv.row(std::iter::once("Variant".to_string()).chain(drift.keys().cloned()));

        for (index, variant) in variants.iter().enumerate() {
            let variant_id = variant
                .output_path()
                .and_then(Utf8Path::file_stem)
                .unwrap_or_default();

            let marks = drift.values().map(|members| {
                if members.contains(&index) {
                    "✅"
                } else {
                    "❌"
                }
            });
            csv.row(std::iter::once(variant_id).chain(marks));
        }

        write_file(&directory.join(format!("{name}.csv")), &csv.output)?;
    }

    write_file(&directory.join("Summary.csv"), &summary.output)?;
    write!(message, "\nFull report written to '{directory}'").ok();

    Ok(message)
}

/// Module name encoded in the file name of a built module, `Name-hash.pcm`
/// or `Name-hash-verify.pcm`.
fn module_name(output_path: &Utf8Path) -> Option<String> {
    let stem = output_path.file_stem()?;
    let stem = stem.strip_suffix("-verify").unwrap_or(stem);
    let name = stem.rsplit_once('-').map_or(stem, |(name, _)| name);
    Some(name.to_string())
}

/// Tokens that appear in some but not all variants, mapped to the indices of
/// the variants that contain them, in order of first appearance.
fn drifting_tokens(variants: &[DependencyInfo]) -> IndexMap<String, BTreeSet<usize>> {
    let mut tokens = IndexMap::<String, BTreeSet<usize>>::new();

    for (index, variant) in variants.iter().enumerate() {
        let cwd = format!("CWD: {}", variant.working_directory);
        let arguments = variant
            .only_command()
            .map(|command| command.arguments.as_slice())
            .unwrap_or_default();

        for token in std::iter::once(&cwd).chain(arguments) {
            if is_location_token(token) {
                continue;
            }
            tokens.entry(token.clone()).or_default().insert(index);
        }
    }

    tokens.retain(|_, members| members.len() != variants.len());
    tokens
}

/// Module paths and CAS URLs differ between variants as a function of the
/// other arguments.
fn is_location_token(token: &str) -> bool {
    if token.starts_with("llvmcas://") {
        return true;
    }

    matches!(
        Utf8Path::new(token).extension(),
        Some("pcm" | "dia" | "d")
    )
}

fn write_file(path: &Utf8Path, contents: &str) -> Result<(), ReportError> {
    fs::write(path, contents).map_err(|source| ReportError::Io {
        path: path.to_owned(),
        source,
    })
}

#[derive(Default)]
struct Csv {
    output: String,
}

impl Csv {
    fn row<I, S>(&mut self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut first = true;
        for field in fields {
            if !first {
                self.output.push(',');
            }
            first = false;

            let field = field.as_ref();
            if field.contains([',', '"', '\n', '\r']) {
                self.output.push('"');
                self.output.push_str(&field.replace('"', "\"\""));
                self.output.push('"');
            } else {
                self.output.push_str(field);
            }
        }
        self.output.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexSet;

    use super::*;
    use crate::graph::info::{CompileCommand, DependencyKind};

    fn variant(output: &str, cwd: &str, arguments: &[&str]) -> DependencyInfo {
        DependencyInfo {
            kind: DependencyKind::Module {
                output_path: output.into(),
            },
            files: IndexSet::new(),
            include_tree_id: None,
            modules: IndexSet::new(),
            working_directory: cwd.into(),
            commands: vec![CompileCommand {
                cache_key: None,
                arguments: arguments.iter().map(|s| s.to_string()).collect(),
            }],
            transitive_include_tree_ids: IndexSet::new(),
            transitive_cache_keys: IndexSet::new(),
            uses_serialized_diagnostics: false,
        }
    }

    #[test]
    fn test_module_name_from_output_path() {
        assert_eq!(module_name(Utf8Path::new("/m/Foo-ABC.pcm")).as_deref(), Some("Foo"));
        assert_eq!(module_name(Utf8Path::new("/m/Foo-ABC-verify.pcm")).as_deref(), Some("Foo"));
        assert_eq!(module_name(Utf8Path::new("/m/My-Lib-XYZ.pcm")).as_deref(), Some("My-Lib"));
    }

    #[test]
    fn test_location_tokens_are_ignored() {
        assert!(is_location_token("/out/A-1.pcm"));
        assert!(is_location_token("-fmodule-file=/out/A-1.pcm"));
        assert!(is_location_token("/out/A-1.dia"));
        assert!(is_location_token("/out/A-1.d"));
        assert!(is_location_token("llvmcas://1234"));
        assert!(!is_location_token("-DDEBUG=1"));
    }

    #[test]
    fn test_report_lists_drifting_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let records = vec![
            variant("/m/Foo-1.pcm", "/w", &["clang", "-O0", "-DA", "-o", "/m/Foo-1.pcm"]),
            variant("/m/Foo-2.pcm", "/w", &["clang", "-O2", "-DA", "-o", "/m/Foo-2.pcm"]),
            variant("/m/Bar-1.pcm", "/w", &["clang", "-O0"]),
        ];

        let message = write_precompiled_modules_report(records, &dir).unwrap();
        assert_eq!(
            message,
            format!("Bar: 1 variant\nFoo: 2 variants\n\nFull report written to '{dir}'")
        );

        let summary = fs::read_to_string(dir.join("Summary.csv")).unwrap();
        assert_eq!(summary, "Name,Variants\nBar,1\nFoo,2\n");

        let foo = fs::read_to_string(dir.join("Foo.csv")).unwrap();
        assert_eq!(foo, "Variant,-O0,-O2\nFoo-1,✅,❌\nFoo-2,❌,✅\n");

        let bar = fs::read_to_string(dir.join("Bar.csv")).unwrap();
        assert_eq!(bar, "Variant\nBar-1\n");
    }

    #[test]
    fn test_working_directory_drift_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let records = vec![
            variant("/m/Foo-1.pcm", "/a", &["clang"]),
            variant("/m/Foo-2.pcm", "/b", &["clang"]),
        ];

        write_precompiled_modules_report(records, &dir).unwrap();

        let foo = fs::read_to_string(dir.join("Foo.csv")).unwrap();
        assert_eq!(foo, "Variant,CWD: /a,CWD: /b\nFoo-1,✅,❌\nFoo-2,❌,✅\n");
    }

    #[test]
    fn test_command_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let mut command = variant("/m/ignored.pcm", "/w", &["clang"]);
        command.kind = DependencyKind::Command;

        let message = write_precompiled_modules_report(vec![command], &dir).unwrap();
        assert!(message.starts_with("\nFull report written to"));
        assert_eq!(
            fs::read_to_string(dir.join("Summary.csv")).unwrap(),
            "Name,Variants\n"
        );
    }
}
