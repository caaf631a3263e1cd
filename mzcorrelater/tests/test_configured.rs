use std::fs;

use clap::Parser;
use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};

use mzcorrelater::{MZCorrelater, ResultDocument};

#[test_log::test]
#[test_log(default_log_filter = "debug")]
fn test_configured() {
    let mut config = Figment::from(Serialized::defaults(MZCorrelater::parse_from([
        "mzcorrelater",
        "-",
    ])));
    config = config.merge(Toml::file_exact("tests/data/configured.toml"));
    let mut driver: MZCorrelater = config.extract().unwrap();
    assert_eq!(driver.input_file, "tests/data/table.json");
    assert_eq!(driver.adducts.len(), 3);
    assert!(!driver.msms.ms2_similarity);
    assert!(driver.msms.check_multimers);

    let output = std::env::temp_dir().join("mzcorrelater_test_configured.json");
    driver.output_file = output.clone();
    driver.main().unwrap();

    let document: ResultDocument =
        serde_json::from_reader(fs::File::open(&output).unwrap()).unwrap();
    fs::remove_file(&output).unwrap();

    assert!(!document.cancelled);
    assert_eq!(document.sample_names, vec!["s1", "s2", "s3"]);
    assert_eq!(document.groups.len(), 1);
    assert_eq!(document.groups[0].rows, vec![1, 2, 3]);
    assert!(document.ms2_similarities.is_empty());

    assert_eq!(document.networks.len(), 1);
    let mut members: Vec<_> = document.networks[0]
        .members
        .iter()
        .map(|m| m.row)
        .collect();
    members.sort();
    assert_eq!(members, vec![1, 2, 3]);

    let sodium = document.rows.iter().find(|r| r.id == 2).unwrap();
    assert_eq!(sodium.ions[0].ion, "[M+Na]+");
    assert_eq!(sodium.ions[0].network, Some(document.networks[0].id));
    let unrelated = document.rows.iter().find(|r| r.id == 4).unwrap();
    assert!(unrelated.ions.is_empty());
    assert_eq!(unrelated.group, None);
}
