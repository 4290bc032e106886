//! Licence plate text normalisation for Indian registration formats.
//!
//! OCR output is cleaned (uppercase alphanumerics only), corrected for common
//! letter/digit confusions based on position, and checked against the known
//! registration layouts. Text that already matches a layout is left alone.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const PLATE_PATTERNS: [&str; 7] = [
    r"^[A-Z]{2}\d{2}[A-Z]{1,2}\d{4}$",
    r"^[A-Z]{2}\d{2}[A-Z]{1,3}\d{1,4}$",
    r"^[A-Z]{2}\d{2}\d{4}$",
    r"^\d{2}BH\d{4}[A-Z]{1,2}$",
    r"^[A-Z]{2}\d{2}[A-Z]\d{4}$",
    r"^CD\d{2}\d{4}$",
    r"^[A-Z]{2}\d{2}S\d{4}$",
];

const STATE_CODES: [&str; 35] = [
    "AN", "AP", "AR", "AS", "BR", "CG", "CH", "DD", "DL", "GA", "GJ", "HP", "HR", "JH", "JK",
    "KA", "KL", "LA", "MH", "ML", "MN", "MP", "MZ", "NL", "OD", "PB", "PY", "RJ", "SK", "TN",
    "TR", "TS", "UK", "UP", "WB",
];

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        PLATE_PATTERNS
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect()
    })
}

fn to_alpha(c: char) -> char {
    match c {
        '0' => 'O',
        '1' => 'I',
        '2' => 'Z',
        '5' => 'S',
        '8' => 'B',
        other => other,
    }
}

fn to_digit(c: char) -> char {
    match c {
        'O' | 'o' => '0',
        'I' | 'i' | 'l' | 'L' => '1',
        'S' | 's' => '5',
        'Z' | 'z' => '2',
        'B' | 'b' => '8',
        'G' | 'g' => '6',
        'T' => '7',
        other => other,
    }
}

/// Uppercase and strip everything but ASCII letters and digits.
pub fn clean_plate_text(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Position-aware correction for the `AA 00 XX 0000` layout: state code is
/// letters, district code digits, the trailing four digits, and the series
/// between them letters. Inputs shorter than six characters are unchanged.
pub fn correct_ocr_errors(text: &str) -> String {
    let mut chars: Vec<char> = text.chars().collect();
    let len = chars.len();
    if len < 6 {
        return text.to_string();
    }
    let trailing_start = 4.max(len - 4);
    for (i, c) in chars.iter_mut().enumerate() {
        let want_alpha = i < 2 || (4..trailing_start).contains(&i);
        if want_alpha && c.is_ascii_digit() {
            *c = to_alpha(*c);
        } else if !want_alpha && c.is_ascii_alphabetic() {
            *c = to_digit(*c);
        }
    }
    chars.into_iter().collect()
}

pub fn validate_plate(text: &str) -> bool {
    let cleaned = clean_plate_text(text);
    patterns().iter().any(|re| re.is_match(&cleaned))
}

pub fn state_code(plate: &str) -> Option<&'static str> {
    let cleaned = clean_plate_text(plate);
    let prefix = cleaned.get(..2)?;
    STATE_CODES.iter().copied().find(|code| *code == prefix)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPlate {
    pub text: String,
    pub valid: bool,
    pub state_code: Option<String>,
}

/// Clean, correct, validate and extract the state code.
pub fn process_plate(raw: &str) -> NormalizedPlate {
    let cleaned = clean_plate_text(raw);
    let text = if validate_plate(&cleaned) {
        cleaned
    } else {
        correct_ocr_errors(&cleaned)
    };
    let valid = validate_plate(&text);
    let state_code = if valid {
        state_code(&text).map(str::to_string)
    } else {
        None
    };
    NormalizedPlate {
        text,
        valid,
        state_code,
    }
}
