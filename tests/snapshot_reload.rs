// Library-level check: a live Taxonomy handle survives a recompile and picks it up on reload.
use std::path::Path;

use taxdb::api::{CompileConfig, ErrorKind, Progress, Taxonomy, compile_dump};

const NODES: &str = "\
1\t|\t1\t|\tno rank\t|
9606\t|\t9605\t|\tspecies\t|
";

fn write_dump(dir: &Path, names: &str) {
    std::fs::write(dir.join("names.dmp"), names).expect("names");
    std::fs::write(dir.join("nodes.dmp"), NODES).expect("nodes");
}

fn compile(dir: &Path) -> Vec<Progress> {
    let mut seen = Vec::new();
    compile_dump(
        &dir.join("names.dmp"),
        &dir.join("nodes.dmp"),
        &dir.join("snapshot"),
        CompileConfig::default(),
        |progress| seen.push(progress),
    )
    .expect("compile");
    seen
}

#[test]
fn reload_sees_recompiled_snapshot() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_dump(
        temp.path(),
        "1\t|\troot\t|\t\t|\tscientific name\t|\n9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|\n",
    );
    let progress = compile(temp.path());
    assert_eq!(progress.last(), Some(&Progress { index: 1, total: 2 }));

    let mut taxonomy = Taxonomy::open(temp.path().join("snapshot")).expect("open");
    assert_eq!(taxonomy.scientific_name("9606").expect("name"), "Homo sapiens");
    assert!(taxonomy.other_names("9606").expect("other").is_empty());

    write_dump(
        temp.path(),
        "1\t|\troot\t|\t\t|\tscientific name\t|\n\
         9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|\n\
         9606\t|\thuman\t|\t\t|\tgenbank common name\t|\n",
    );
    compile(temp.path());

    // Old mapping stays readable until reload.
    assert!(taxonomy.other_names("9606").expect("stale").is_empty());

    taxonomy.reload().expect("reload");
    let other = taxonomy.other_names("9606").expect("fresh");
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].0, "human");
    assert_eq!(other[0].1, "genbank common name");
    assert_eq!(taxonomy.search("HUMAN").expect("search"), vec!["9606"]);
}

#[test]
fn lookups_fail_cleanly_for_unknown_ids() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_dump(temp.path(), "9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|\n");
    compile(temp.path());

    let taxonomy = Taxonomy::open(temp.path().join("snapshot")).expect("open");
    let err = taxonomy.taxon("1").expect_err("id 1 had no names");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let ids: Vec<_> = taxonomy
        .iterate_ids()
        .collect::<Result<_, _>>()
        .expect("ids");
    assert_eq!(ids, vec!["9606"]);
}
