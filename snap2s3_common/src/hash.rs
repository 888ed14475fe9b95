// snap2s3_common is the main snap2s3 library implementing the migration core.
// Copyright (C) 2025  snap2s3 contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::progress::UnitCounter;
use crate::HashDiff;

use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncReadExt};
use walkdir::WalkDir;

/// Read granularity for hashing and raw device streaming (256 KiB).
pub const BLOCK_SIZE: usize = 256 * 1024;

/// Computes the MD5 of everything the reader yields,
/// returned as a lowercase hex digest.
pub async fn md5_of_reader<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    let mut buf = vec![0; BLOCK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// One `<digest>  <path>` line of a per-file hash list.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashLine {
    pub path: String,
    pub digest: String,
}

impl fmt::Display for HashLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}  {}", self.digest, self.path)
    }
}

fn relative_name(path: &Path) -> String {
    let path = path.strip_prefix("./").unwrap_or(path);
    path.to_string_lossy().into_owned()
}

/// Hashes every regular file of a tar stream without materializing it.
/// Blocking; run it on a blocking thread with the async side bridged in.
pub fn md5_of_tar_stream<R: Read>(reader: R) -> io::Result<Vec<HashLine>> {
    let mut archive = tar::Archive::new(reader);
    let mut lines = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = relative_name(&entry.path()?);

        let mut hasher = Md5::new();
        io::copy(&mut entry, &mut hasher)?;

        lines.push(HashLine {
            path,
            digest: hex::encode(hasher.finalize()),
        });
    }

    Ok(lines)
}

/// Hashes every regular file under `root`, paths relative to `root`.
/// Blocking; the counter accounts for the bytes read.
pub fn md5_of_dir(root: &Path, counter: &mut UnitCounter) -> io::Result<Vec<HashLine>> {
    let mut lines = Vec::new();
    let mut buf = vec![0; BLOCK_SIZE];

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = relative_name(
            entry
                .path()
                .strip_prefix(root)
                .map_err(io::Error::other)?,
        );

        let mut file = File::open(entry.path())?;
        let mut hasher = Md5::new();
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }

            hasher.update(&buf[..n]);
            counter.add(n as u64);
        }

        lines.push(HashLine {
            path,
            digest: hex::encode(hasher.finalize()),
        });
    }

    Ok(lines)
}

/// Sums the sizes of all regular files under `root`.
/// Used as the pre-upload stream size estimate for archives.
pub fn tree_size(root: &Path) -> io::Result<u64> {
    let mut total = 0;

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(io::Error::other)?.len();
        }
    }

    Ok(total)
}

/// Sorts the lines by path and writes them out, one per line.
/// Returns the number of lines written.
pub fn write_sorted(lines: &mut Vec<HashLine>, path: &Path) -> io::Result<u64> {
    lines.sort_unstable_by(|a, b| a.path.cmp(&b.path));

    let mut out = BufWriter::new(File::create(path)?);
    for line in lines.iter() {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;

    Ok(lines.len() as u64)
}

fn read_hash_file(path: &Path) -> io::Result<Vec<HashLine>> {
    let mut lines = Vec::new();

    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        let (digest, path) = line
            .split_once("  ")
            .ok_or_else(|| io::Error::other(format!("malformed hash line \"{}\"", line)))?;

        lines.push(HashLine {
            path: path.to_string(),
            digest: digest.to_string(),
        });
    }

    Ok(lines)
}

/// Compares two sorted hash-list files line by line. Returns the count
/// of matching entries and the list of differences; validation passes
/// only if the differences are empty and the matched count agrees with
/// both line counts.
pub fn compare_hash_files(local: &Path, remote: &Path) -> io::Result<(u64, Vec<HashDiff>)> {
    let local = read_hash_file(local)?;
    let remote = read_hash_file(remote)?;

    let mut matched = 0;
    let mut diffs = Vec::new();

    let mut l = local.iter().peekable();
    let mut r = remote.iter().peekable();

    loop {
        match (l.peek(), r.peek()) {
            (Some(a), Some(b)) if a.path == b.path => {
                if a.digest == b.digest {
                    matched += 1;
                } else {
                    diffs.push(HashDiff::Mismatch {
                        path: a.path.clone(),
                        local: a.digest.clone(),
                        remote: b.digest.clone(),
                    });
                }

                l.next();
                r.next();
            }
            (Some(a), Some(b)) if a.path < b.path => {
                diffs.push(HashDiff::MissingOnRemote(a.path.clone()));
                l.next();
            }
            (Some(_), Some(b)) => {
                diffs.push(HashDiff::MissingOnLocal(b.path.clone()));
                r.next();
            }
            (Some(a), None) => {
                diffs.push(HashDiff::MissingOnRemote(a.path.clone()));
                l.next();
            }
            (None, Some(b)) => {
                diffs.push(HashDiff::MissingOnLocal(b.path.clone()));
                r.next();
            }
            (None, None) => break,
        }
    }

    Ok((matched, diffs))
}

#[cfg(test)]
mod tests {
    use super::*;

    use indicatif::ProgressBar;

    fn counter() -> UnitCounter {
        UnitCounter::new(ProgressBar::hidden(), 1024)
    }

    #[tokio::test]
    async fn hashes_a_byte_stream() {
        let digest = md5_of_reader(&b"hello world"[..]).await.unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn hashes_an_empty_stream() {
        let digest = md5_of_reader(&b""[..]).await.unwrap();
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn hashes_a_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("top"), b"hello world").unwrap();
        std::fs::write(dir.path().join("sub/nested"), b"").unwrap();

        let mut lines = md5_of_dir(dir.path(), &mut counter()).unwrap();
        lines.sort_unstable_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].path, "sub/nested");
        assert_eq!(lines[0].digest, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(lines[1].path, "top");
        assert_eq!(lines[1].digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn hashes_regular_files_of_a_tar_stream() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_size(11);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "./top", &b"hello world"[..])
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "sub/nested", &b""[..]).unwrap();

        let bytes = builder.into_inner().unwrap();
        let lines = md5_of_tar_stream(&bytes[..]).unwrap();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].path, "top");
        assert_eq!(lines[0].digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(lines[1].path, "sub/nested");
    }

    #[test]
    fn tree_size_sums_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), vec![0; 100]).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0; 42]).unwrap();

        assert_eq!(tree_size(dir.path()).unwrap(), 142);
    }

    #[test]
    fn comparison_is_order_independent_and_counts_matches() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("local.md5");
        let remote_path = dir.path().join("remote.md5");

        // "a.b" sorts before "a/b" bytewise; both sides sort the same way.
        let mut local = vec![
            HashLine {
                path: "a/b".to_string(),
                digest: "11".to_string(),
            },
            HashLine {
                path: "a.b".to_string(),
                digest: "22".to_string(),
            },
        ];
        let mut remote = vec![
            HashLine {
                path: "a.b".to_string(),
                digest: "22".to_string(),
            },
            HashLine {
                path: "a/b".to_string(),
                digest: "11".to_string(),
            },
        ];

        assert_eq!(write_sorted(&mut local, &local_path).unwrap(), 2);
        assert_eq!(write_sorted(&mut remote, &remote_path).unwrap(), 2);
        assert_eq!(local[0].path, "a.b");

        let (matched, diffs) = compare_hash_files(&local_path, &remote_path).unwrap();
        assert_eq!(matched, 2);
        assert!(diffs.is_empty());
    }

    #[test]
    fn comparison_reports_missing_and_differing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("local.md5");
        let remote_path = dir.path().join("remote.md5");

        let mut local = vec![
            HashLine {
                path: "both".to_string(),
                digest: "aa".to_string(),
            },
            HashLine {
                path: "local-only".to_string(),
                digest: "bb".to_string(),
            },
        ];
        let mut remote = vec![
            HashLine {
                path: "both".to_string(),
                digest: "ff".to_string(),
            },
            HashLine {
                path: "remote-only".to_string(),
                digest: "cc".to_string(),
            },
        ];

        write_sorted(&mut local, &local_path).unwrap();
        write_sorted(&mut remote, &remote_path).unwrap();

        let (matched, diffs) = compare_hash_files(&local_path, &remote_path).unwrap();
        assert_eq!(matched, 0);
        assert_eq!(
            diffs,
            vec![
                HashDiff::Mismatch {
                    path: "both".to_string(),
                    local: "aa".to_string(),
                    remote: "ff".to_string(),
                },
                HashDiff::MissingOnRemote("local-only".to_string()),
                HashDiff::MissingOnLocal("remote-only".to_string()),
            ]
        );
    }
}
