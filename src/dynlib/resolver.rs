use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{Error, Result};
use crate::utils;

use super::cache::LoaderCache;
use super::elf::BinaryInspector;

/// Canonical library path to the set of SONAME aliases that resolve to it.
pub type LibraryClosure = BTreeMap<PathBuf, BTreeSet<String>>;

/// Invoked before each visited file is read; an `Err` aborts the traversal.
pub type FilterFn<'a> = &'a dyn Fn(&Path) -> Result<()>;

/// Computes the transitive library closure for a set of binaries.
///
/// Every import is located by trying `search_path` (the eventual
/// LD_LIBRARY_PATH inside the sandbox), then the loader cache, then
/// `fallback_path`.  Hits from `search_path` are traversed but not recorded,
/// since such libraries stay visible through the real search path and need
/// no mount.  `extra_libs` name objects the program only reaches via
/// dlopen(3); they are folded into the first binary's import list.
pub fn resolve_libraries(
    cache: &LoaderCache,
    inspector: &dyn BinaryInspector,
    binaries: &[PathBuf],
    extra_libs: &[String],
    search_path: &[PathBuf],
    fallback_path: &[PathBuf],
    filter: Option<FilterFn>,
) -> Result<LibraryClosure> {
    let mut libraries: HashMap<String, PathBuf> = HashMap::new();
    let mut checked_file: HashSet<PathBuf> = HashSet::new();
    let mut checked_lib: HashSet<String> = HashSet::new();

    let mut extra_libs = Some(extra_libs.to_vec());
    let mut to_check: VecDeque<PathBuf> = binaries.iter().cloned().collect();

    // Breadth-first over the binaries and everything they pull in.
    while let Some(fname) = to_check.pop_front() {
        if let Some(filter) = filter {
            filter(&fname).inspect_err(|e| debug!("dynlib: filter rejected: {e}"))?;
        }

        let mut imports = inspector.imported_libraries(&fname)?;
        debug!("dynlib: {} imports {:?}", fname.display(), imports);
        checked_file.insert(fname);

        // The dlopen()ed extras need recursive resolution too, so they ride
        // along with the first file visited.
        if let Some(extras) = extra_libs.take() {
            imports.extend(extras);
        }

        for lib in imports {
            if checked_lib.contains(&lib) {
                continue;
            }

            let in_path =
                |dirs: &[PathBuf]| dirs.iter().map(|d| d.join(&lib)).find(|p| utils::file_exists(p));

            let (lib_path, record) = if let Some(p) = in_path(search_path) {
                debug!("dynlib: found {lib} (LD_LIBRARY_PATH)");
                (p, false)
            } else if let Some(p) = cache.lookup(&lib) {
                debug!("dynlib: found {lib} (ld.so.cache)");
                (p.to_path_buf(), true)
            } else if let Some(p) = in_path(fallback_path) {
                debug!("dynlib: found {lib} (filesystem)");
                (p, true)
            } else {
                return Err(Error::UnresolvedLibrary(lib));
            };

            if record {
                libraries.insert(lib.clone(), lib_path.clone());
            }
            checked_lib.insert(lib);

            if !checked_file.contains(&lib_path) && !to_check.contains(&lib_path) {
                to_check.push_back(lib_path);
            }
        }
    }

    // De-duplicate by canonical path; everything else becomes a symlink.
    let mut closure = LibraryClosure::new();
    for (alias, path) in libraries {
        let real = fs::canonicalize(&path)?;
        closure.entry(real).or_default().insert(alias);
    }

    Ok(closure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs::File;

    #[derive(Default)]
    struct FakeInspector {
        imports: HashMap<PathBuf, Vec<String>>,
    }

    impl BinaryInspector for FakeInspector {
        fn imported_libraries(&self, path: &Path) -> Result<Vec<String>> {
            Ok(self.imports.get(path).cloned().unwrap_or_default())
        }
        fn verify_class(&self, _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        cache: LoaderCache,
        inspector: FakeInspector,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                dir: tempfile::tempdir().unwrap(),
                cache: LoaderCache::default(),
                inspector: FakeInspector::default(),
            }
        }

        fn add(&mut self, soname: Option<&str>, file: &str, imports: &[&str]) -> PathBuf {
            let path = self.dir.path().join(file);
            File::create(&path).unwrap();
            let path = path.canonicalize().unwrap();
            self.inspector
                .imports
                .insert(path.clone(), imports.iter().map(|s| s.to_string()).collect());
            if let Some(soname) = soname {
                self.cache.insert_for_tests(soname, &path);
            }
            path
        }
    }

    #[test]
    fn test_closure_with_extras() {
        let mut fx = Fixture::new();
        let lib_c = fx.add(Some("libC.so"), "libC.so.1", &[]);
        let lib_a = fx.add(Some("libA.so"), "libA.so.1", &["libC.so"]);
        let lib_extra = fx.add(Some("libExtra.so"), "libExtra.so.1", &["libC.so"]);
        let binary = fx.add(None, "B", &["libA.so"]);

        let closure = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary.clone()],
            &["libExtra.so".into()],
            &[],
            &[],
            None,
        )
        .unwrap();

        let expect: Vec<(PathBuf, Vec<String>)> = vec![
            (lib_a, vec!["libA.so".into()]),
            (lib_c, vec!["libC.so".into()]),
            (lib_extra, vec!["libExtra.so".into()]),
        ];
        let got: Vec<(PathBuf, Vec<String>)> = closure
            .iter()
            .map(|(p, a)| (p.clone(), a.iter().cloned().collect()))
            .collect();
        let mut expect = expect;
        expect.sort();
        assert_eq!(got, expect);
        assert!(!closure.contains_key(&binary));
    }

    #[test]
    fn test_closure_is_import_complete() {
        let mut fx = Fixture::new();
        fx.add(Some("libleaf.so"), "libleaf.so.0", &[]);
        fx.add(Some("libmid.so"), "libmid.so.0", &["libleaf.so"]);
        let binary = fx.add(None, "app", &["libmid.so"]);

        let closure = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary],
            &[],
            &[],
            &[],
            None,
        )
        .unwrap();

        // Every import of every member is itself a member.
        let members: HashSet<String> = closure.values().flatten().cloned().collect();
        for path in closure.keys() {
            for import in fx.inspector.imported_libraries(path).unwrap() {
                assert!(members.contains(&import), "{import} missing from closure");
            }
        }
    }

    #[test]
    fn test_search_path_hits_are_not_recorded() {
        let mut fx = Fixture::new();
        // Present both on the search path and in the cache; the search path
        // wins and keeps the library out of the closure.
        let bundled = fx.add(None, "libbundled.so", &[]);
        fx.cache.insert_for_tests("libbundled.so", &bundled);
        let binary = fx.add(None, "app", &["libbundled.so"]);

        let closure = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary],
            &[],
            &[fx.dir.path().to_path_buf()],
            &[],
            None,
        )
        .unwrap();
        assert!(closure.is_empty());
    }

    #[test]
    fn test_unresolved_is_fatal() {
        let mut fx = Fixture::new();
        let binary = fx.add(None, "app", &["libnowhere.so"]);

        let err = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary],
            &[],
            &[],
            &[],
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnresolvedLibrary(name) if name == "libnowhere.so"));
    }

    #[test]
    fn test_filter_rejection_is_fatal() {
        let mut fx = Fixture::new();
        fx.add(Some("libbad.so"), "libbad.so.0", &[]);
        let binary = fx.add(None, "app", &["libbad.so"]);

        let filter = |path: &Path| -> Result<()> {
            if path.file_name().is_some_and(|n| {
                n.to_string_lossy().starts_with("libbad")
            }) {
                return Err(Error::RejectedByFilter(path.to_path_buf()));
            }
            Ok(())
        };

        let err = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary],
            &[],
            &[],
            &[],
            Some(&filter),
        )
        .unwrap_err();
        assert!(matches!(err, Error::RejectedByFilter(_)));
    }

    #[test]
    fn test_aliases_group_by_canonical_path() {
        let mut fx = Fixture::new();
        let real = fx.add(Some("libz.so.1"), "libz.so.1.2.11", &[]);
        let link = fx.dir.path().join("libz.so");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        fx.cache.insert_for_tests("libz.so", &link);
        let binary = fx.add(None, "app", &["libz.so", "libz.so.1"]);

        let closure = resolve_libraries(
            &fx.cache,
            &fx.inspector,
            &[binary],
            &[],
            &[],
            &[],
            None,
        )
        .unwrap();

        assert_eq!(closure.len(), 1);
        let aliases = closure.values().next().unwrap();
        assert_eq!(
            aliases.iter().cloned().collect::<Vec<_>>(),
            vec!["libz.so", "libz.so.1"]
        );
    }
}
