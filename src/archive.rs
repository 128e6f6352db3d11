use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::error::NbiaError;

const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";
const DICOM_PREAMBLE: usize = 128;
const DICOM_MAGIC: &[u8; 4] = b"DICM";
pub const MD5_LISTING: &str = "md5hashes.csv";

/// What a verified package contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageSummary {
    pub files: usize,
    pub md5_checked: usize,
}

/// Checks that `zip_path` is a complete, readable package.
///
/// Every entry is decompressed so the CRC of each member is checked. With
/// `verify_md5`, the package must carry `md5hashes.csv` and every file it
/// lists must match its digest.
pub fn verify_package(zip_path: &Path, verify_md5: bool) -> Result<PackageSummary, NbiaError> {
    let mut file = fs::File::open(zip_path)
        .map_err(|err| NbiaError::Integrity(format!("open {}: {err}", zip_path.display())))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) if &magic == ZIP_MAGIC => {}
        Ok(()) => {
            return Err(NbiaError::Integrity(
                "package is not a zip container".to_string(),
            ));
        }
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(NbiaError::Integrity("package is empty or truncated".to_string()));
        }
        Err(err) => return Err(NbiaError::Integrity(err.to_string())),
    }

    let file = fs::File::open(zip_path).map_err(|err| NbiaError::Integrity(err.to_string()))?;
    let mut archive = ZipArchive::new(file).map_err(|err| NbiaError::Integrity(err.to_string()))?;

    let mut digests = BTreeMap::new();
    let mut listing = None;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| NbiaError::Integrity(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if verify_md5 {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|err| NbiaError::Integrity(format!("{name}: {err}")))?;
            if is_listing(&name) {
                listing = Some(String::from_utf8_lossy(&data).into_owned());
            } else {
                digests.insert(name, format!("{:x}", md5::compute(&data)));
            }
        } else {
            io::copy(&mut entry, &mut io::sink())
                .map_err(|err| NbiaError::Integrity(format!("{name}: {err}")))?;
            if !is_listing(&name) {
                digests.insert(name, String::new());
            }
        }
    }

    if digests.is_empty() {
        return Err(NbiaError::Integrity("package contains no files".to_string()));
    }

    let mut md5_checked = 0;
    if verify_md5 {
        let listing = listing.ok_or_else(|| {
            NbiaError::Integrity(format!("package carries no {MD5_LISTING}"))
        })?;
        for (file_name, expected) in parse_md5_listing(&listing) {
            let actual = listed_digest(&digests, file_name)?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(NbiaError::Integrity(format!(
                    "md5 mismatch for {file_name}: expected {expected}, got {actual}"
                )));
            }
            md5_checked += 1;
        }
    }

    debug!(path = %zip_path.display(), files = digests.len(), md5_checked, "package verified");
    Ok(PackageSummary {
        files: digests.len(),
        md5_checked,
    })
}

/// Finds the digest of a listed file: by full entry name, or by base name
/// when exactly one entry carries it.
fn listed_digest<'a>(
    digests: &'a BTreeMap<String, String>,
    file_name: &str,
) -> Result<&'a str, NbiaError> {
    if let Some(digest) = digests.get(file_name) {
        return Ok(digest);
    }
    let wanted = base_name(file_name);
    let mut candidates = digests
        .iter()
        .filter(|(name, _)| base_name(name) == wanted)
        .map(|(_, digest)| digest.as_str());
    match (candidates.next(), candidates.next()) {
        (Some(digest), None) => Ok(digest),
        (None, _) => Err(NbiaError::Integrity(format!(
            "{file_name} is listed but missing"
        ))),
        (Some(_), Some(_)) => Err(NbiaError::Integrity(format!(
            "{file_name} matches more than one package entry"
        ))),
    }
}

/// Checks that `path` is a non-empty DICOM Part 10 file: a 128-byte
/// preamble followed by `DICM`.
pub fn verify_dicom(path: &Path) -> Result<u64, NbiaError> {
    let mut file = fs::File::open(path)
        .map_err(|err| NbiaError::Integrity(format!("open {}: {err}", path.display())))?;
    let mut head = [0u8; DICOM_PREAMBLE + 4];
    match file.read_exact(&mut head) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(NbiaError::Integrity("image is empty or truncated".to_string()));
        }
        Err(err) => return Err(NbiaError::Integrity(err.to_string())),
    }
    if &head[DICOM_PREAMBLE..] != DICOM_MAGIC {
        return Err(NbiaError::Integrity(
            "image is not a DICOM file".to_string(),
        ));
    }
    let bytes = file
        .metadata()
        .map_err(|err| NbiaError::Integrity(err.to_string()))?
        .len();
    Ok(bytes)
}

/// Unpacks `zip_path` into `target_dir`, refusing entries that escape it.
pub fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<usize, NbiaError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| NbiaError::Extraction(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| NbiaError::Extraction(err.to_string()))?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| NbiaError::Extraction(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(NbiaError::Extraction(format!(
                    "zip entry {} escapes the target directory",
                    entry.name()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| NbiaError::Extraction(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| NbiaError::Extraction(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| NbiaError::Extraction(err.to_string()))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| NbiaError::Extraction(err.to_string()))?;
        written += 1;
    }
    Ok(written)
}

fn is_listing(name: &str) -> bool {
    base_name(name).eq_ignore_ascii_case(MD5_LISTING)
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Rows of `file,digest`; a header row or anything without a hex digest is skipped.
fn parse_md5_listing(listing: &str) -> Vec<(&str, &str)> {
    listing
        .lines()
        .filter_map(|line| {
            let (file_name, digest) = line.split_once(',')?;
            let file_name = file_name.trim().trim_matches('"');
            let digest = digest.trim().trim_matches('"');
            let is_digest = digest.len() == 32 && digest.chars().all(|c| c.is_ascii_hexdigit());
            (is_digest && !file_name.is_empty()).then_some((file_name, digest))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_skips_header() {
        let rows = parse_md5_listing(
            "File Name,MD5 Hash\r\n1-01.dcm,d41d8cd98f00b204e9800998ecf8427e\r\n",
        );
        assert_eq!(rows, vec![("1-01.dcm", "d41d8cd98f00b204e9800998ecf8427e")]);
    }

    #[test]
    fn listing_keeps_entry_paths() {
        let rows = parse_md5_listing("a/1-01.dcm,d41d8cd98f00b204e9800998ecf8427e\n");
        assert_eq!(rows, vec![("a/1-01.dcm", "d41d8cd98f00b204e9800998ecf8427e")]);
    }

    fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
        use std::io::Write;

        use zip::ZipWriter;
        use zip::write::SimpleFileOptions;

        let mut writer = ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn same_base_name_in_two_folders_counts_twice() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.zip");
        let first: &[u8] = b"first image";
        let second: &[u8] = b"second image";
        let listing = format!(
            "File Name,MD5 Hash\na/1-01.dcm,{:x}\nb/1-01.dcm,{:x}\n",
            md5::compute(first),
            md5::compute(second)
        );
        write_package(
            &path,
            &[
                ("a/1-01.dcm", first),
                ("b/1-01.dcm", second),
                (MD5_LISTING, listing.as_bytes()),
            ],
        );

        let summary = verify_package(&path, false).unwrap();
        assert_eq!(summary.files, 2);

        let summary = verify_package(&path, true).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(summary.md5_checked, 2);
    }

    #[test]
    fn ambiguous_base_name_in_listing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.zip");
        let data: &[u8] = b"image";
        let listing = format!("1-01.dcm,{:x}\n", md5::compute(data));
        write_package(
            &path,
            &[
                ("a/1-01.dcm", data),
                ("b/1-01.dcm", data),
                (MD5_LISTING, listing.as_bytes()),
            ],
        );

        let err = verify_package(&path, true).unwrap_err();
        assert!(matches!(err, NbiaError::Integrity(ref message) if message.contains("more than one")));
    }

    #[test]
    fn base_name_rows_match_a_single_nested_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.zip");
        let data: &[u8] = b"image";
        let listing = format!("1-01.dcm,{:x}\n", md5::compute(data));
        write_package(&path, &[("series/1-01.dcm", data), (MD5_LISTING, listing.as_bytes())]);

        let summary = verify_package(&path, true).unwrap();
        assert_eq!(summary.md5_checked, 1);
    }

    #[test]
    fn dicom_files_need_the_preamble_marker() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.dcm");
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[1, 2, 3]);
        fs::write(&good, &bytes).unwrap();
        assert_eq!(verify_dicom(&good).unwrap(), 135);

        let bad = dir.path().join("bad.dcm");
        fs::write(&bad, b"<html>not found</html>").unwrap();
        assert!(matches!(verify_dicom(&bad), Err(NbiaError::Integrity(_))));

        let empty = dir.path().join("empty.dcm");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(verify_dicom(&empty), Err(NbiaError::Integrity(_))));
    }

    #[test]
    fn non_zip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.zip");
        fs::write(&path, b"<html>error</html>").unwrap();
        let err = verify_package(&path, false).unwrap_err();
        assert!(matches!(err, NbiaError::Integrity(_)));
    }
}
