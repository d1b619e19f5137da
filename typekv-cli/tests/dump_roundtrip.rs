use std::io::{BufWriter, Cursor};
use std::sync::Arc;

use typekv::db::Database;
use typekv::kv::MemoryKv;
use typekv_cli::dump;

#[test]
fn export_then_import_preserves_documents_and_secondary_index() {
    let source_db = Database::new(Arc::new(MemoryKv::new()));
    let source = dump::open_collection(&source_db, &["widgets"]);
    source.insert_with_id("w1".into(), dump::RawDocument(serde_json::json!({"name": "sprocket", "qty": 4}))).unwrap();
    source.insert_with_id("w2".into(), dump::RawDocument(serde_json::json!({"name": "cog", "qty": 9}))).unwrap();

    let mut buf = BufWriter::new(Vec::new());
    let exported = dump::export(&source, &mut buf).unwrap();
    assert_eq!(exported, 2);
    let bytes = buf.into_inner().unwrap();

    let target_db = Database::new(Arc::new(MemoryKv::new()));
    let target = dump::open_collection(&target_db, &["widgets"]);
    let imported = dump::import(&target, Cursor::new(bytes)).unwrap();
    assert_eq!(imported, 2);

    let cog = target.get("w2").unwrap().unwrap();
    assert_eq!(cog.value.0["qty"], 9);
    assert_eq!(target_db.count_all().unwrap(), source_db.count_all().unwrap());
}

#[test]
fn load_is_idempotent_for_the_same_dump() {
    let db = Database::new(Arc::new(MemoryKv::new()));
    let collection = dump::open_collection(&db, &["notes"]);
    let dump_text = "{\"id\":\"n1\",\"value\":{\"text\":\"hi\"}}\n";

    dump::import(&collection, dump_text.as_bytes()).unwrap();
    dump::import(&collection, dump_text.as_bytes()).unwrap();

    assert_eq!(collection.count(Default::default(), None).unwrap(), 1);
}
