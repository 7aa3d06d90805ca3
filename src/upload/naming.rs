//! Sibling names for promotions onto an occupied path.

/// `dir/name.ext` -> `dir/name_<n>.ext`. The suffix goes before the last
/// extension; dot-files and extensionless names get it at the end.
pub fn duplicate_name(path: &str, n: u32) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };

    let renamed = match file.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &file[..dot], n, &file[dot..]),
        _ => format!("{}_{}", file, n),
    };

    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}
