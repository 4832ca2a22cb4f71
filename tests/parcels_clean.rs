use std::fs;
use std::path::PathBuf;

use tempfile::tempdir;
use tidecast::{
    clean_parcel_files, write_parcels_csv, ParcelCleanConfig, ParcelError, ParcelSkipReason,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("parcels")
        .join(name)
}

#[test]
fn combines_exports_with_different_layouts() {
    let paths = vec![fixture("tybee_2022.csv"), fixture("tybee_2023.csv")];

    let outcome = clean_parcel_files(&paths, &ParcelCleanConfig::default()).unwrap();

    let addresses: Vec<&str> = outcome
        .table
        .records
        .iter()
        .map(|record| record.address.as_str())
        .collect();
    assert_eq!(
        addresses,
        vec![
            "12 BUTLER AVE TYBEE ISLAND",
            "7 N CAMPBELL AVE TYBEE ISLAND",
            "1404 VENETIAN DR",
        ]
    );
    // The 2023 copy of 12 Butler Ave is identical to the 2022 row.
    assert_eq!(outcome.duplicates_removed, 2);
    assert_eq!(
        outcome.table.records[0].values,
        vec!["412000", "389000", "0.12", "1978"]
    );

    let first = &outcome.files[0];
    assert_eq!(first.rows_read, 5);
    assert_eq!(first.rows_dropped, 2);
    assert_eq!(first.rows_kept, 3);
    assert!(first.skipped.is_none());

    let second = &outcome.files[1];
    assert_eq!(second.rows_dropped, 1);
    assert_eq!(second.rows_kept, 2);
}

#[test]
fn unusable_files_are_skipped_and_reported() {
    let paths = vec![
        fixture("no_sale_price.csv"),
        fixture("tybee_2023.csv"),
        fixture("owners_only.csv"),
        fixture("does_not_exist.csv"),
    ];

    let outcome = clean_parcel_files(&paths, &ParcelCleanConfig::default()).unwrap();

    assert_eq!(outcome.table.records.len(), 2);
    assert_eq!(
        outcome.files[0].skipped,
        Some(ParcelSkipReason::MissingRequiredColumns(vec![
            "Sale Price".to_string()
        ]))
    );
    assert!(outcome.files[1].skipped.is_none());
    assert_eq!(
        outcome.files[2].skipped,
        Some(ParcelSkipReason::NoAddressColumns)
    );
    assert!(matches!(
        outcome.files[3].skipped,
        Some(ParcelSkipReason::Unreadable(_))
    ));
}

#[test]
fn all_files_unusable_is_an_error() {
    let paths = vec![fixture("no_sale_price.csv"), fixture("owners_only.csv")];

    let err = clean_parcel_files(&paths, &ParcelCleanConfig::default()).unwrap_err();

    assert!(matches!(err, ParcelError::NoUsableInputs { files: 2 }));
}

#[test]
fn writes_address_first_column_order() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("preprocessed_parcels_data.csv");
    let outcome =
        clean_parcel_files(&[fixture("tybee_2023.csv")], &ParcelCleanConfig::default()).unwrap();

    write_parcels_csv(&out, &outcome.table).unwrap();

    let text = fs::read_to_string(&out).unwrap();
    assert_eq!(
        text,
        "Property Address,Fair Market Value,Sale Price,Acres,Year Built\n\
         12 BUTLER AVE TYBEE ISLAND,412000,389000,0.12,1978\n\
         1404 VENETIAN DR,702000,650000,0.22,2001\n"
    );
}
