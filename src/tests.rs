use super::*;
use crate::predict::PredictionRow;

#[test]
fn csv_has_header_and_one_row_per_recommendation() {
    let rows = vec![
        PredictionRow {
            user_id: "cx:13563753207631091420187:v4m7n38yvolp".to_string(),
            url: "http://adressa.no/nyheter/article1.html".to_string(),
        },
        PredictionRow {
            user_id: "cx:13563753207631091420187:v4m7n38yvolp".to_string(),
            url: "http://adressa.no/sport/article2.html".to_string(),
        },
    ];

    let csv = render_csv(&rows);
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "userId,url");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].ends_with("article1.html"));
    assert!(lines[2].ends_with("article2.html"));
}

#[test]
fn csv_fields_with_separators_are_quoted() {
    assert_eq!(csv_field("plain"), "plain");
    assert_eq!(csv_field("a,b"), "\"a,b\"");
    assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
}

#[test]
fn empty_batch_renders_header_only() {
    assert_eq!(render_csv(&[]), "userId,url\n");
}

#[test]
fn comma_lists_are_trimmed_and_emptiness_filtered() {
    assert_eq!(
        parse_list("sport, okonomi ,nyheter"),
        vec!["sport", "okonomi", "nyheter"]
    );
    assert!(parse_list("").is_empty());
    assert!(parse_list(" , ,").is_empty());
}

#[test]
fn env_parsed_falls_back_on_missing_or_bad_values() {
    // Use a key no other test touches; env mutation is process-global.
    std::env::remove_var("NEWSGRAPH_TEST_LIMIT");
    assert_eq!(env_parsed("NEWSGRAPH_TEST_LIMIT", 10i64), 10);

    std::env::set_var("NEWSGRAPH_TEST_LIMIT", "25");
    assert_eq!(env_parsed("NEWSGRAPH_TEST_LIMIT", 10i64), 25);

    std::env::set_var("NEWSGRAPH_TEST_LIMIT", "not-a-number");
    assert_eq!(env_parsed("NEWSGRAPH_TEST_LIMIT", 10i64), 10);
    std::env::remove_var("NEWSGRAPH_TEST_LIMIT");
}
