/* File digests for end-to-end verification. */

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};

use crate::{Error, Result};

const BLOCK_SIZE: usize = 64 * 1024;

/// MD5 of the file at `path` as 32 lowercase hex characters, the form in
/// which digests travel on the wire.
pub fn file_md5(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::storage(path, e))?;
    let mut hasher = Md5::new();
    let mut block = vec![0u8; BLOCK_SIZE];
    loop {
        let n = file.read(&mut block).map_err(|e| Error::storage(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert_eq!(
            file_md5(&path).unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        File::create(&path)
            .unwrap()
            .write_all(b"abc")
            .unwrap();
        assert_eq!(
            file_md5(&path).unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
