// Source model id to target model id, read in both directions.
const MODEL_TABLE: &[(&str, &str)] = &[
    ("gemma-3-1b-it", "gemma3:1b"),
    ("gemma-3-4b-it", "gemma3:4b"),
    ("gemma-3-12b-it", "gemma3:12b"),
    ("gemma-3-27b-it", "gemma3:27b"),
    ("gemma-3n-e2b-it", "gemma3n:E2b"),
    ("gemma-3n-e4b-it", "gemma3n:E4b"),
];

pub fn to_target(model: &str) -> &str {
    MODEL_TABLE
        .iter()
        .find(|(source, _)| *source == model)
        .map(|(_, target)| *target)
        .unwrap_or(model)
}

pub fn to_source(model: &str) -> &str {
    MODEL_TABLE
        .iter()
        .find(|(_, target)| *target == model)
        .map(|(source, _)| *source)
        .unwrap_or(model)
}
