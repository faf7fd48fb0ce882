#![allow(dead_code)]

use std::fs;
use std::path::Path;

use datapile::{DirCache, Workspace};
use url::Url;

pub fn workspace(root: &Path) -> Workspace<DirCache> {
    Workspace::init(root).expect("init workspace")
}

pub fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, bytes).expect("write file");
}

pub fn file_url(dir: &Path) -> String {
    Url::from_directory_path(dir)
        .expect("absolute directory")
        .to_string()
}

/// A CSV with a header and `rows` rows, tagged so versions differ.
pub fn transactions(rows: usize, tag: &str) -> Vec<u8> {
    let mut csv = String::from("id,conta,valor,descricao\n");
    for i in 0..rows {
        csv.push_str(&format!(
            "{i},{:06},{}.{:02},{tag} pagamento {}\n",
            i % 997,
            i * 7 % 10_000,
            i % 100,
            i % 13
        ));
    }
    csv.into_bytes()
}
