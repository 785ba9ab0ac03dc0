#![allow(dead_code)]

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;

/// Build an uncompressed tar holding `files` as regular entries.
pub fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *content).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    gzip(&tar_bytes(files))
}

/// Hex-style release: an outer plain tar whose sources live in `contents.tar.gz`.
pub fn hex_release(files: &[(&str, &[u8])]) -> Vec<u8> {
    let contents = tar_gz(files);
    tar_bytes(&[
        ("VERSION", b"3"),
        ("CHECKSUM", b"0000"),
        ("metadata.config", b"{<<\"name\">>,<<\"pkg\">>}."),
        ("contents.tar.gz", &contents),
    ])
}

/// A tar whose single entry carries `name` verbatim, bypassing the
/// builder's own path validation.
pub fn tar_with_raw_name(name: &[u8], content: &[u8]) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, content).unwrap();
    builder.into_inner().unwrap()
}

/// A tar with one regular file plus a symlink `link` pointing at `target`.
pub fn tar_with_symlink(link: &str, target: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut file = tar::Header::new_gnu();
    file.set_size(3);
    file.set_mode(0o644);
    file.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut file, "pkg/lib/a.ex", &b"abc"[..]).unwrap();

    let mut header = tar::Header::new_gnu();
    header.set_size(0);
    header.set_mode(0o777);
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_link_name(target).unwrap();
    builder.append_data(&mut header, link, std::io::empty()).unwrap();

    builder.into_inner().unwrap()
}

/// Names of everything directly under `dir`.
pub fn children(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
