//! Search-path handling and native library lookup

use std::path::{Path, PathBuf};

use crate::error::{SystemError, SystemResult};

/// Separator between elements of a search path
pub const PATH_SEPARATOR: char = ':';

/// Separator between components of a file path
pub const FILE_SEPARATOR: char = '/';

/// Longest path the host accepts
pub const MAX_PATH_LEN: usize = libc::PATH_MAX as usize;

#[cfg(target_os = "macos")]
const LIB_SUFFIX: &str = ".dylib";
#[cfg(not(target_os = "macos"))]
const LIB_SUFFIX: &str = ".so";
const LIB_PREFIX: &str = "lib";

/// Split a search path into its elements
///
/// Empty elements are kept (`"a::b"` has three elements). Every element
/// must leave room for a file name of `file_name_length` bytes under
/// [`MAX_PATH_LEN`]; otherwise nothing is returned. An empty path or a zero
/// file name length yields no elements.
pub fn split_path(path: &str, file_name_length: usize) -> SystemResult<Vec<String>> {
    if path.is_empty() || file_name_length == 0 {
        return Ok(Vec::new());
    }
    path.split(PATH_SEPARATOR)
        .map(|element| {
            let length = element.len() + file_name_length;
            if length > MAX_PATH_LEN {
                return Err(SystemError::PathTooLong {
                    length,
                    limit: MAX_PATH_LEN,
                });
            }
            Ok(element.to_string())
        })
        .collect()
}

/// [`split_path`] that terminates the process on an oversized element
///
/// Meant for startup, where a path that cannot be searched leaves nothing
/// sensible to continue with.
pub fn split_path_or_exit(path: &str, file_name_length: usize) -> Vec<String> {
    match split_path(path, file_name_length) {
        Ok(elements) => elements,
        Err(err) => {
            tracing::error!(target: "os::thread", error = %err, "search path rejected");
            eprintln!("Error occurred during initialization of VM");
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

/// Platform file name of the native library `name`, e.g. `libnet.so`
#[must_use]
pub fn dll_build_name(name: &str) -> String {
    format!("{LIB_PREFIX}{name}{LIB_SUFFIX}")
}

/// Whether `path` names an existing file system entry
#[must_use]
pub fn file_exists(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    !path.as_os_str().is_empty() && std::fs::metadata(path).is_ok()
}

fn concat_and_check(dir: &str, file: &str) -> Option<PathBuf> {
    let full = if dir.ends_with(FILE_SEPARATOR) {
        format!("{dir}{file}")
    } else {
        format!("{dir}{FILE_SEPARATOR}{file}")
    };
    file_exists(&full).then(|| PathBuf::from(full))
}

/// Locate the native library `name` along `search`
///
/// An empty `search` means the current directory. A value containing
/// [`PATH_SEPARATOR`] is searched element by element, skipping empty ones.
/// Anything else is a single directory.
pub fn dll_locate_lib(search: &str, name: &str) -> SystemResult<Option<PathBuf>> {
    let file = dll_build_name(name);

    if search.is_empty() {
        let cwd = std::env::current_dir().map_err(|e| SystemError::platform("getcwd", &e))?;
        return Ok(concat_and_check(&cwd.to_string_lossy(), &file));
    }

    if search.contains(PATH_SEPARATOR) {
        let found = split_path(search, file.len())?
            .iter()
            .filter(|dir| !dir.is_empty())
            .find_map(|dir| concat_and_check(dir, &file));
        return Ok(found);
    }

    Ok(concat_and_check(search, &file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("/usr/lib", &["/usr/lib"])]
    #[case("/a:/b", &["/a", "/b"])]
    #[case("/a::/b", &["/a", "", "/b"])]
    #[case(":", &["", ""])]
    #[case("/a:", &["/a", ""])]
    fn splits_keeping_empty_elements(#[case] path: &str, #[case] expected: &[&str]) {
        assert_eq!(split_path(path, 8).unwrap(), expected);
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        assert!(split_path("", 8).unwrap().is_empty());
        assert!(split_path("/a:/b", 0).unwrap().is_empty());
    }

    #[test]
    fn oversized_element_is_rejected() {
        let long = "x".repeat(MAX_PATH_LEN);
        let path = format!("/ok:{long}");
        assert_eq!(
            split_path(&path, 1),
            Err(SystemError::PathTooLong {
                length: MAX_PATH_LEN + 1,
                limit: MAX_PATH_LEN,
            })
        );
    }

    #[test]
    fn element_exactly_at_limit_is_accepted() {
        let element = "y".repeat(MAX_PATH_LEN - 4);
        assert_eq!(split_path(&element, 4).unwrap().len(), 1);
    }

    #[test]
    fn library_names() {
        assert!(dll_build_name("net").starts_with("libnet."));
        assert!(dll_build_name("net").ends_with(LIB_SUFFIX));
    }

    #[test]
    fn missing_files() {
        assert!(!file_exists(""));
        assert!(!file_exists("/definitely/not/here"));
    }
}
