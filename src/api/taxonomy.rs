//! Purpose: Taxonomy lookups over one snapshot (data store + metadata store).
//! Exports: `Taxonomy`, `Taxon`, `TaxonName`.
//! Role: Explicit handle replacing any process-wide shared instance; callers own its lifecycle.
//! Invariants: Both stores come from the same directory and are reloaded together.
//! Invariants: Data payload is `[parent, rank, scientific name, other names...]`.
use std::path::{Path, PathBuf};

use bstr::{BString, ByteSlice};
use serde::Serialize;

use crate::core::codec::Record;
use crate::core::dump::{DATA_FILE, INFO_FILE};
use crate::core::error::{Error, ErrorKind};
use crate::core::store::{Ids, RecordStore};

const PARENT_FIELD: usize = 1;
const RANK_FIELD: usize = 2;
const FIRST_NAME_FIELD: usize = 3;
const FIRST_CLASS_FIELD: usize = 1;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct TaxonName {
    pub name: String,
    pub class: String,
}

/// Decoded view of one taxon; text is converted lossily for display.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Taxon {
    pub id: String,
    pub parent: String,
    pub rank: String,
    pub scientific_name: String,
    pub other_names: Vec<TaxonName>,
}

pub struct Taxonomy {
    dir: Option<PathBuf>,
    data: RecordStore,
    info: RecordStore,
}

impl Taxonomy {
    /// Opens `DATA_FILE` and `INFO_FILE` from `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, Error> {
        let dir = dir.as_ref().to_path_buf();
        let data = RecordStore::open(dir.join(DATA_FILE)).map_err(add_snapshot_hint)?;
        let info = RecordStore::open(dir.join(INFO_FILE)).map_err(add_snapshot_hint)?;
        tracing::debug!(dir = %dir.display(), "opened taxonomy snapshot");
        Ok(Self {
            dir: Some(dir),
            data,
            info,
        })
    }

    pub fn from_stores(data: RecordStore, info: RecordStore) -> Self {
        Self {
            dir: None,
            data,
            info,
        }
    }

    /// Re-reads both store files; every cached lookup is dropped.
    ///
    /// Both files are mapped before either store is swapped, so a failure
    /// leaves the handle on the previous snapshot.
    pub fn reload(&mut self) -> Result<(), Error> {
        let data = self.data.stage_reload().map_err(add_snapshot_hint)?;
        let info = self.info.stage_reload().map_err(add_snapshot_hint)?;
        self.data.apply_reload(data);
        self.info.apply_reload(info);
        Ok(())
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn data(&self) -> &RecordStore {
        &self.data
    }

    pub fn info(&self) -> &RecordStore {
        &self.info
    }

    /// Raw data record: `[id, parent, rank, names...]`.
    pub fn get_record(&self, id: &str) -> Result<Record, Error> {
        self.data.get(id).map_err(|err| unknown_id(err, id))
    }

    pub fn scientific_name(&self, id: &str) -> Result<BString, Error> {
        let record = self.get_record(id)?;
        let name = record
            .get(FIRST_NAME_FIELD)
            .ok_or_else(|| short_record(id, "scientific name"))?;
        Ok(BString::from(name.as_bytes()))
    }

    /// `(name, class)` pairs for every name except the scientific one.
    pub fn other_names(&self, id: &str) -> Result<Vec<(BString, BString)>, Error> {
        let record = self.get_record(id)?;
        let classes = self.info.get(id).map_err(|err| unknown_id(err, id))?;
        Ok(pair_names(&record, &classes).into_iter().skip(1).collect())
    }

    pub fn taxon(&self, id: &str) -> Result<Taxon, Error> {
        let record = self.get_record(id)?;
        let classes = self.info.get(id).map_err(|err| unknown_id(err, id))?;
        let field = |index: usize, what: &str| {
            record
                .get(index)
                .map(|value| value.to_str_lossy().into_owned())
                .ok_or_else(|| short_record(id, what))
        };
        Ok(Taxon {
            id: record.id().to_str_lossy().into_owned(),
            parent: field(PARENT_FIELD, "parent")?,
            rank: field(RANK_FIELD, "rank")?,
            scientific_name: field(FIRST_NAME_FIELD, "scientific name")?,
            other_names: pair_names(&record, &classes)
                .into_iter()
                .skip(1)
                .map(|(name, class)| TaxonName {
                    name: name.to_str_lossy().into_owned(),
                    class: class.to_str_lossy().into_owned(),
                })
                .collect(),
        })
    }

    /// Identifiers of every taxon whose record contains `text`, ASCII case-insensitively.
    pub fn search(&self, text: &str) -> Result<Vec<BString>, Error> {
        self.data.search(text)
    }

    /// Like `search`, keeping only taxa whose rank mentions "species".
    pub fn search_species(&self, text: &str) -> Result<Vec<BString>, Error> {
        let mut hits = Vec::new();
        for id in self.data.search(text)? {
            let record = self.data.get(&id)?;
            let is_species = record
                .get(RANK_FIELD)
                .is_some_and(|rank| rank.contains_str("species"));
            if is_species {
                hits.push(id);
            }
        }
        Ok(hits)
    }

    pub fn iterate_ids(&self) -> Ids<'_> {
        self.data.ids()
    }
}

fn pair_names(record: &Record, classes: &Record) -> Vec<(BString, BString)> {
    let names = record.fields().get(FIRST_NAME_FIELD..).unwrap_or(&[]);
    let classes = classes.fields().get(FIRST_CLASS_FIELD..).unwrap_or(&[]);
    names.iter().cloned().zip(classes.iter().cloned()).collect()
}

fn unknown_id(err: Error, id: &str) -> Error {
    if err.kind() != ErrorKind::NotFound {
        return err;
    }
    err.with_message(format!("unknown taxonomy id {id}"))
        .with_hint("Use `taxdb search <text>` to find identifiers.")
}

fn short_record(id: &str, what: &str) -> Error {
    Error::new(ErrorKind::MalformedInput).with_message(format!("taxon {id} has no {what} field"))
}

fn add_snapshot_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::NotFound || err.hint().is_some() {
        return err;
    }
    err.with_message("taxonomy snapshot file is missing")
        .with_hint("Build one with `taxdb compile --names names.dmp --nodes nodes.dmp`.")
}

#[cfg(test)]
mod tests {
    use super::{Taxon, TaxonName, Taxonomy};
    use crate::core::dump::{CompileConfig, INFO_FILE, compile_dump};
    use crate::core::error::ErrorKind;
    use crate::core::store::StoreBuilder;
    use bstr::BString;

    const NAMES: &str = "\
9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|
9606\t|\thuman\t|\t\t|\tgenbank common name\t|
9605\t|\tHomo\t|\tHomo <primates>\t|\tscientific name\t|
63221\t|\tHomo sapiens neanderthalensis\t|\t\t|\tscientific name\t|
63221\t|\tNeandertal\t|\t\t|\tcommon name\t|
";

    const NODES: &str = "\
9605\t|\t207598\t|\tgenus\t|
9606\t|\t9605\t|\tspecies\t|
63221\t|\t9606\t|\tsubspecies\t|
";

    fn compiled() -> (tempfile::TempDir, Taxonomy) {
        let dir = tempfile::tempdir().expect("tempdir");
        let names = dir.path().join("names.dmp");
        let nodes = dir.path().join("nodes.dmp");
        std::fs::write(&names, NAMES).expect("names");
        std::fs::write(&nodes, NODES).expect("nodes");
        compile_dump(&names, &nodes, dir.path(), CompileConfig::default(), |_| {})
            .expect("compile");
        let taxonomy = Taxonomy::open(dir.path()).expect("open");
        (dir, taxonomy)
    }

    fn pair(name: &str, class: &str) -> (BString, BString) {
        (BString::from(name), BString::from(class))
    }

    #[test]
    fn scientific_name_comes_first() {
        let (_dir, taxonomy) = compiled();
        let record = taxonomy.get_record("9606").expect("record");
        let fields: Vec<String> = record.fields().iter().map(|f| f.to_string()).collect();
        assert_eq!(fields, ["9606", "9605", "species", "Homo sapiens", "human"]);
        assert_eq!(taxonomy.scientific_name("9606").expect("name"), "Homo sapiens");
        assert_eq!(
            taxonomy.other_names("9606").expect("other"),
            vec![pair("human", "genbank common name")]
        );
    }

    #[test]
    fn other_names_empty_when_only_scientific() {
        let (_dir, taxonomy) = compiled();
        assert!(taxonomy.other_names("9605").expect("other").is_empty());
        assert_eq!(taxonomy.scientific_name("9605").expect("name"), "Homo <primates>");
    }

    #[test]
    fn unknown_ids_are_not_found_with_hint() {
        let (_dir, taxonomy) = compiled();
        for result in [
            taxonomy.get_record("1").map(|_| ()),
            taxonomy.scientific_name("1").map(|_| ()),
            taxonomy.other_names("1").map(|_| ()),
            taxonomy.taxon("1").map(|_| ()),
        ] {
            let err = result.expect_err("unknown");
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert!(err.hint().is_some());
        }
    }

    #[test]
    fn search_and_species_filter() {
        let (_dir, taxonomy) = compiled();
        let all = taxonomy.search("homo").expect("search");
        assert_eq!(all, vec![BString::from("9606"), BString::from("9605"), BString::from("63221")]);
        let species = taxonomy.search_species("homo").expect("species");
        assert_eq!(species, vec![BString::from("9606"), BString::from("63221")]);
    }

    #[test]
    fn taxon_view_pairs_names_with_classes() {
        let (_dir, taxonomy) = compiled();
        assert_eq!(
            taxonomy.taxon("63221").expect("taxon"),
            Taxon {
                id: "63221".into(),
                parent: "9606".into(),
                rank: "subspecies".into(),
                scientific_name: "Homo sapiens neanderthalensis".into(),
                other_names: vec![TaxonName {
                    name: "Neandertal".into(),
                    class: "common name".into(),
                }],
            }
        );
    }

    #[test]
    fn iterate_ids_in_dump_order() {
        let (_dir, taxonomy) = compiled();
        let ids: Vec<String> = taxonomy
            .iterate_ids()
            .map(|id| id.expect("id").to_string())
            .collect();
        assert_eq!(ids, ["9606", "9605", "63221"]);
    }

    #[test]
    fn reload_picks_up_rebuilt_snapshot() {
        let (dir, mut taxonomy) = compiled();
        assert_eq!(taxonomy.scientific_name("9606").expect("name"), "Homo sapiens");

        let names = dir.path().join("names.dmp");
        std::fs::write(
            &names,
            "9606\t|\tHomo sapiens sapiens\t|\t\t|\tscientific name\t|\n",
        )
        .expect("names");
        compile_dump(
            &names,
            &dir.path().join("nodes.dmp"),
            dir.path(),
            CompileConfig::default(),
            |_| {},
        )
        .expect("recompile");

        assert_eq!(taxonomy.scientific_name("9606").expect("stale"), "Homo sapiens");
        taxonomy.reload().expect("reload");
        assert_eq!(taxonomy.scientific_name("9606").expect("fresh"), "Homo sapiens sapiens");
        assert_eq!(taxonomy.iterate_ids().count(), 1);
        assert_eq!(taxonomy.dir(), Some(dir.path()));
    }

    #[test]
    fn failed_reload_keeps_both_stores_on_previous_snapshot() {
        let (dir, mut taxonomy) = compiled();
        assert_eq!(taxonomy.other_names("9606").expect("other").len(), 1);

        let names = dir.path().join("names.dmp");
        std::fs::write(
            &names,
            "9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|\n\
             9606\t|\tman\t|\t\t|\tcommon name\t|\n\
             9606\t|\thuman\t|\t\t|\tgenbank common name\t|\n",
        )
        .expect("names");
        compile_dump(
            &names,
            &dir.path().join("nodes.dmp"),
            dir.path(),
            CompileConfig::default(),
            |_| {},
        )
        .expect("recompile");
        std::fs::remove_file(dir.path().join(INFO_FILE)).expect("remove info");

        let err = taxonomy.reload().expect_err("info missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(taxonomy.data().version(), 0);
        assert_eq!(taxonomy.info().version(), 0);
        assert_eq!(
            taxonomy.other_names("9606").expect("other"),
            vec![pair("human", "genbank common name")]
        );
        assert_eq!(taxonomy.search("neandertal").expect("search"), vec![BString::from("63221")]);
    }

    #[test]
    fn from_stores_has_no_directory() {
        let mut data = StoreBuilder::new();
        data.insert(&["1", "1", "no rank", "root"]).expect("insert");
        let mut info = StoreBuilder::new();
        info.insert(&["1", "scientific name"]).expect("insert");
        let mut taxonomy = Taxonomy::from_stores(data.build(), info.build());
        assert!(taxonomy.dir().is_none());
        assert_eq!(taxonomy.scientific_name("1").expect("name"), "root");
        assert_eq!(taxonomy.reload().expect_err("no file").kind(), ErrorKind::Usage);
    }

    #[test]
    fn missing_snapshot_has_build_hint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = match Taxonomy::open(dir.path()) {
            Ok(_) => panic!("expected missing snapshot"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.hint().unwrap_or_default().contains("taxdb compile"));
    }
}
