//! Bundle packages: recognizing them and unpacking them.
//!
//! A package is a zip archive (`.jar`, `.war` or `.zip`) whose root holds a
//! `component.xml`. Anything else in the components directory is ignored.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use zip::ZipArchive;

use crate::constants::{BUNDLE_DESCRIPTOR, BUNDLE_EXTENSIONS};
use crate::error::{Error, Result};

use super::descriptor::BundleDescriptor;

/// Bundle name for a package file, or `None` if `path` is not a package.
///
/// The name is the file stem, lowercased: `Echo.JAR` becomes `echo`.
pub fn package_name(path: &Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if !BUNDLE_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    Some(stem.to_lowercase())
}

/// Unpack `package` into `dest`.
///
/// Returns `Ok(false)` without touching the filesystem when the archive
/// has no descriptor, since such a package is not a component. The
/// descriptor is validated before `dest` is created, so a package with a
/// broken one leaves nothing behind. Manifest entries are skipped, as are
/// entries whose path would escape `dest`. A failure part-way through
/// removes `dest` again.
pub fn extract(bundle: &str, package: &Path, dest: &Path) -> Result<bool> {
    let load_error = |reason: String| Error::Load {
        bundle: bundle.to_string(),
        class: String::new(),
        reason,
    };

    let file = File::open(package)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| load_error(format!("cannot read {}: {e}", package.display())))?;

    let xml = match archive.by_name(BUNDLE_DESCRIPTOR) {
        Ok(mut entry) => {
            let mut xml = String::new();
            entry
                .read_to_string(&mut xml)
                .map_err(|e| load_error(format!("cannot read {BUNDLE_DESCRIPTOR}: {e}")))?;
            xml
        }
        Err(_) => {
            log::debug!(
                "[Loader] {} has no {BUNDLE_DESCRIPTOR}; not a component",
                package.display()
            );
            return Ok(false);
        }
    };
    BundleDescriptor::parse(bundle, &xml)?;

    fs::create_dir_all(dest)?;
    log::debug!("[Loader] Extracting {bundle} into {}", dest.display());

    let unpacked = unpack(&mut archive, dest).map_err(|e| load_error(e.to_string()));
    if unpacked.is_err() {
        let _ = fs::remove_dir_all(dest);
    }
    unpacked.map(|()| true)
}

fn unpack(archive: &mut ZipArchive<File>, dest: &Path) -> std::result::Result<(), Box<dyn std::error::Error>> {
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name().to_lowercase().ends_with("manifest.mf") {
            continue;
        }
        let Some(relative) = entry.enclosed_name() else {
            log::warn!("[Loader] Skipping unsafe archive entry '{}'", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use zip::write::SimpleFileOptions;

    fn write_package(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_package_name() {
        assert_eq!(package_name(Path::new("/x/Echo.JAR")).as_deref(), Some("echo"));
        assert_eq!(package_name(Path::new("weather.war")).as_deref(), Some("weather"));
        assert_eq!(package_name(Path::new("lua.zip")).as_deref(), Some("lua"));
        assert_eq!(package_name(Path::new("notes.txt")), None);
        assert_eq!(package_name(Path::new("echo")), None);
    }

    #[test]
    fn test_extract_skips_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("echo.jar");
        write_package(
            &package,
            &[
                ("META-INF/MANIFEST.MF", "Manifest-Version: 1.0"),
                (
                    "component.xml",
                    "<component><class>echo.Main</class><subdomain>echo</subdomain></component>",
                ),
                ("lib/echo.lua", "return {}"),
            ],
        );
        let dest = dir.path().join("echo");

        assert!(extract("echo", &package, &dest).unwrap());
        assert!(dest.join("component.xml").is_file());
        assert!(dest.join("lib/echo.lua").is_file());
        assert!(!dest.join("META-INF/MANIFEST.MF").exists());
    }

    #[test]
    fn test_package_without_descriptor_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("library.jar");
        write_package(&package, &[("lib/util.lua", "return {}")]);
        let dest = dir.path().join("library");

        assert!(!extract("library", &package, &dest).unwrap());
        assert!(!dest.exists());
    }

    #[test]
    fn test_broken_descriptor_is_rejected_before_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("echo.zip");
        write_package(
            &package,
            &[
                ("component.xml", "<component><name>No class</name></component>"),
                ("echo/Main.lua", "return {}"),
            ],
        );
        let dest = dir.path().join("echo");

        let err = extract("echo", &package, &dest).unwrap_err();
        assert!(matches!(err, Error::BundleDescriptor { .. }), "got {err:?}");
        assert!(!dest.exists());
    }

    #[test]
    fn test_corrupt_package_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let package = dir.path().join("broken.jar");
        fs::write(&package, b"definitely not a zip").unwrap();
        let dest: PathBuf = dir.path().join("broken");

        let err = extract("broken", &package, &dest).unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(!dest.exists());
    }
}
