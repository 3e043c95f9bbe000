use anyhow::Result;
use image::{
    apply_patch, diff_dimg_files, merge_cdimg, merge_chain_bisect, merge_chain_linear,
    merge_dimg_files, pack_cdimg, pack_dir_to_dimg, CdimgFile, DiffConfig, DimgFile, DimgStore,
    EntryType, ImageChain, MergeConfig, PatchOptions,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Regular files below `root` by relative path
fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().into_owned();
            (rel, fs::read(e.path()).unwrap())
        })
        .collect()
}

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    (0..len).map(|_| rng.gen()).collect()
}

/// Three generations of a small root filesystem
struct Generations {
    dir: TempDir,
    roots: Vec<PathBuf>,
}

impl Generations {
    fn build() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut rng = StdRng::seed_from_u64(7);
        let mut lib = random_bytes(&mut rng, 16 * 1024);
        let mut roots = Vec::new();

        for gen in 1..=3u8 {
            let root = dir.path().join(format!("gen{}", gen));
            fs::create_dir_all(root.join("etc"))?;
            fs::create_dir_all(root.join("usr/lib"))?;
            fs::write(root.join("etc/hostname"), b"box\n")?;
            fs::write(root.join("etc/version"), format!("release {}\n", gen))?;
            // mutate a few bytes per generation so deltas stay small
            for i in 0..32 {
                let pos = (i * 499 + gen as usize * 31) % lib.len();
                lib[pos] = lib[pos].wrapping_add(gen);
            }
            fs::write(root.join("usr/lib/libfoo.so"), &lib)?;
            if gen >= 2 {
                fs::write(root.join("usr/lib/plugin.so"), vec![gen; 2048])?;
            }
            if gen == 1 {
                fs::write(root.join("etc/legacy.conf"), b"old=true\n")?;
            }
            std::os::unix::fs::symlink("libfoo.so", root.join("usr/lib/libfoo.so.1"))?;
            roots.push(root);
        }
        Ok(Self { dir, roots })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Pack generation 1 and diff 1->2 and 2->3
    fn images(&self) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let config = DiffConfig {
            threads: 2,
            ..Default::default()
        };
        let full: Vec<PathBuf> = (0..3)
            .map(|i| {
                let out = self.path(&format!("full{}.dimg", i + 1));
                pack_dir_to_dimg(&self.roots[i], &out, 2).map(|_| out)
            })
            .collect::<image::Result<_>>()?;
        let base = full[0].clone();
        let d12 = self.path("d12.dimg");
        let d23 = self.path("d23.dimg");
        diff_dimg_files(&DimgFile::open(&full[0])?, &DimgFile::open(&full[1])?, &d12, &config)?;
        diff_dimg_files(&DimgFile::open(&full[1])?, &DimgFile::open(&full[2])?, &d23, &config)?;
        Ok((base, d12, d23))
    }
}

#[test]
fn test_merged_diff_applies_like_the_chain() -> Result<()> {
    let gens = Generations::build()?;
    let (base, d12, d23) = gens.images()?;
    let merge_config = MergeConfig {
        threads: 2,
        verify: true,
        ..Default::default()
    };
    let d13 = gens.path("d13.dimg");
    let header = merge_dimg_files(&d12, &d23, &d13, &merge_config)?;
    assert_eq!(header.id, DimgFile::open(&d23)?.id());
    assert_eq!(header.parent_id, Some(DimgFile::open(&base)?.id()));

    let options = PatchOptions {
        verify: true,
        ..Default::default()
    };
    let out1 = gens.path("out1");
    apply_patch(None, &out1, &DimgFile::open(&base)?, &options)?;
    assert_eq!(snapshot(&out1), snapshot(&gens.roots[0]));

    // one step through the merged image
    let out3 = gens.path("out3");
    apply_patch(Some(&out1), &out3, &DimgFile::open(&d13)?, &options)?;
    assert_eq!(snapshot(&out3), snapshot(&gens.roots[2]));
    assert_eq!(
        fs::read_link(out3.join("usr/lib/libfoo.so.1"))?,
        Path::new("libfoo.so")
    );

    // two steps through the individual diffs
    let out2 = gens.path("out2");
    let out3b = gens.path("out3b");
    apply_patch(Some(&out1), &out2, &DimgFile::open(&d12)?, &options)?;
    apply_patch(Some(&out2), &out3b, &DimgFile::open(&d23)?, &options)?;
    assert_eq!(snapshot(&out3b), snapshot(&out3));

    // merging must leave its inputs untouched
    assert!(d12.exists() && d23.exists());
    Ok(())
}

#[test]
fn test_chain_reader_and_chain_merges() -> Result<()> {
    let gens = Generations::build()?;
    let (base, d12, d23) = gens.images()?;
    let chain = vec![d23.clone(), d12.clone(), base.clone()];

    let reader = ImageChain::open(&chain)?.with_verify(true);
    let expected = snapshot(&gens.roots[2]);
    for (path, content) in &expected {
        assert_eq!(&reader.read_file(path)?, content, "{}", path);
    }
    assert_eq!(reader.read_link("usr/lib/libfoo.so.1")?, "libfoo.so");
    assert_eq!(reader.attr("usr/lib")?.entry_type, EntryType::Dir);
    assert!(reader.attr("etc/legacy.conf").is_err());

    let merge_config = MergeConfig {
        threads: 2,
        ..Default::default()
    };
    let linear = gens.path("linear.dimg");
    let bisect = gens.path("bisect.dimg");
    let scratch = gens.path("scratch");
    fs::create_dir_all(&scratch)?;
    merge_chain_linear(&chain, &linear, &scratch, &merge_config)?;
    merge_chain_bisect(&chain, &bisect, &scratch, &merge_config)?;
    assert_eq!(fs::read_dir(&scratch)?.count(), 0);

    for merged in [&linear, &bisect] {
        let img = DimgFile::open(merged)?;
        assert!(img.header().is_base());
        let out = gens.path(&format!("out-{}", img.file_digest().to_hex()));
        apply_patch(None, &out, &img, &PatchOptions::default())?;
        assert_eq!(snapshot(&out), expected);
    }
    Ok(())
}

#[test]
fn test_store_finds_chain() -> Result<()> {
    let gens = Generations::build()?;
    let (base, d12, d23) = gens.images()?;
    let top_id = DimgFile::open(&d23)?.id();

    let store = DimgStore::open(&gens.path("store"))?;
    for p in [&base, &d12, &d23] {
        store.add_dimg(p)?;
    }
    let reopened = DimgStore::open(store.dir())?;
    assert_eq!(reopened.list().len(), 3);

    let layers = reopened.open_chain(&top_id)?;
    assert_eq!(layers.len(), 3);
    let reader = ImageChain::new(layers)?;
    assert_eq!(reader.read_file("etc/version")?, b"release 3\n");
    Ok(())
}

#[test]
fn test_cdimg_merge_keeps_upper_config() -> Result<()> {
    let gens = Generations::build()?;
    let (base, d12, d23) = gens.images()?;
    let cfg1 = gens.path("config1.json");
    let cfg2 = gens.path("config2.json");
    fs::write(&cfg1, br#"{"architecture":"amd64","config":{"Env":["GEN=2"]}}"#)?;
    fs::write(&cfg2, br#"{"architecture":"amd64","config":{"Env":["GEN=3"]}}"#)?;

    let c12 = gens.path("d12.cdimg");
    let c23 = gens.path("d23.cdimg");
    pack_cdimg(&cfg1, &d12, &c12)?;
    pack_cdimg(&cfg2, &d23, &c23)?;

    let c13 = gens.path("d13.cdimg");
    let header = merge_cdimg(&c12, &c23, &c13, &MergeConfig::default())?;
    let merged = CdimgFile::open(&c13)?;
    assert_eq!(merged.config["config"]["Env"][0], "GEN=3");
    assert_eq!(merged.dimg().id(), header.id);
    assert_eq!(
        merged.config["rootfs"]["diff_ids"][0],
        header.id.to_string()
    );

    let out1 = gens.path("c-out1");
    let out3 = gens.path("c-out3");
    apply_patch(None, &out1, &DimgFile::open(&base)?, &PatchOptions::default())?;
    apply_patch(Some(&out1), &out3, merged.dimg(), &PatchOptions::default())?;
    assert_eq!(snapshot(&out3), snapshot(&gens.roots[2]));
    Ok(())
}
