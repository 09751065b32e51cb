//! Generate seed corpus for fuzzing
//!
//! Each seed is one selector byte (the container format) followed by a
//! package built with the library.

use std::fs;
use std::path::PathBuf;
use update_pkg::{FileInfo, PackMethod, PackageInfo, PackageManager, PackageType};

const SELECTORS: [(PackageType, u8, &str); 4] = [
    (PackageType::Upgrade, 0, "bin"),
    (PackageType::Zip, 1, "zip"),
    (PackageType::Gzip, 2, "gz"),
    (PackageType::Lz4, 3, "lz4"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let corpus_dir = "fuzz/corpus/fuzz_package_parse";
    fs::create_dir_all(corpus_dir)?;
    let work_dir = std::env::temp_dir().join("update-pkg-seeds");
    fs::create_dir_all(&work_dir)?;

    println!("Generating seed corpus...");

    let small = work_dir.join("small.txt");
    fs::write(&small, b"Hello, World!")?;
    let large = work_dir.join("large.txt");
    fs::write(&large, b"This is test data for compression. ".repeat(1000))?;
    let binary = work_dir.join("binary.dat");
    fs::write(&binary, (0..=255u8).collect::<Vec<u8>>())?;

    let seeds: Vec<(&str, PackageType, Vec<(PathBuf, FileInfo)>)> = vec![
        (
            "upgrade_two_components",
            PackageType::Upgrade,
            vec![
                (small.clone(), FileInfo::new("kernel", PackMethod::None)),
                (binary.clone(), FileInfo::new("rootfs", PackMethod::None)),
            ],
        ),
        (
            "zip_multi",
            PackageType::Zip,
            vec![
                (small.clone(), FileInfo::new("file1.txt", PackMethod::None)),
                (large.clone(), FileInfo::new("dir/file2.txt", PackMethod::Zip)),
                (binary.clone(), FileInfo::new("binary.dat", PackMethod::Zip)),
            ],
        ),
        (
            "gzip_large",
            PackageType::Gzip,
            vec![(large.clone(), FileInfo::new("large.txt", PackMethod::Gzip))],
        ),
        (
            "lz4_frame",
            PackageType::Lz4,
            vec![(large.clone(), FileInfo::new("large.txt", PackMethod::Lz4))],
        ),
        (
            "lz4_block",
            PackageType::Lz4,
            vec![(binary.clone(), FileInfo::new("binary.dat", PackMethod::Lz4Block))],
        ),
    ];

    let mut manager = PackageManager::default();
    for (name, package_type, files) in &seeds {
        let (_, selector, extension) = SELECTORS
            .iter()
            .find(|(kind, _, _)| kind == package_type)
            .ok_or("no selector for package type")?;
        let package = work_dir.join(format!("{}.{}", name, extension));
        manager.create_package(&package, None, &PackageInfo::new(*package_type), files)?;

        let mut seed = vec![*selector];
        seed.extend(fs::read(&package)?);
        let path = format!("{}/seed_{}", corpus_dir, name);
        fs::write(&path, seed)?;
        println!("✓ Generated: {}", path);
    }

    fs::remove_dir_all(&work_dir)?;
    println!("\nGenerated {} seed files in {}", seeds.len(), corpus_dir);
    Ok(())
}
