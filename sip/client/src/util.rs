use bytesstr::BytesStr;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};

pub(crate) fn random_string() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(30)
        .map(char::from)
        .collect::<String>()
        .into()
}

/// Short lowercase token used for generated hostnames
pub(crate) fn random_token() -> String {
    rng()
        .sample_iter(Alphanumeric)
        .take(12)
        .map(|c| char::from(c.to_ascii_lowercase()))
        .collect()
}

pub(crate) fn random_sequence_number() -> u32 {
    rng().random_range(0..(u32::MAX >> 1))
}
