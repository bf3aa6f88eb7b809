use std::path::Path;

use rawpull_adapters::{load_fixture_bundle, FixtureAdapter, SyncMode, VendorAdapter};

#[test]
fn shipped_survey_bundle_loads() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
    let bundle = load_fixture_bundle(root.join("fixtures/survey_bundle.json")).unwrap();
    let adapter = FixtureAdapter::new("fixture_survey", bundle);

    let responses = adapter.stream("responses").unwrap();
    assert_eq!(responses.mode, SyncMode::Incremental);
    assert_eq!(responses.raw_table, "raw_fixture_survey_responses");
    assert_eq!(adapter.stream("questions").unwrap().mode, SyncMode::FullRefresh);
}
