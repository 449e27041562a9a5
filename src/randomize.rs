// src/randomize.rs
//
// Synthetic field values for document templates.
//
// Value *shapes* are fixed (see the regexes in the tests below); the values
// themselves come from the thread-local RNG. Name-like fields are drawn from
// the corpus bundled in data/data.json.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use base64::Engine;
use chrono::{Datelike, Local};
use rand::distr::Alphanumeric;
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::Deserialize;

const CORPUS_JSON: &str = include_str!("../data/data.json");

const MONTH_ABBREV: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// February is always 28; leap years are not modeled.
const DAYS_IN_MONTH: [u32; 12] = [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

pub const FIRST_YEAR: i32 = 1920;
pub const IMAGE_SIDE: usize = 128;

#[derive(Debug, Deserialize)]
pub struct FirstNames {
    pub male: Vec<String>,
    pub female: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StateEntry {
    pub code: String,
    pub name: String,
}

/// Closed word lists backing the name/address generators.
#[derive(Debug, Deserialize)]
pub struct RandomCorpus {
    pub first_names: FirstNames,
    pub last_names: Vec<String>,
    pub street_names: Vec<String>,
    pub street_suffixes: Vec<String>,
    pub cities: Vec<String>,
    pub credit_card_masks: Vec<String>,
    pub area_codes: Vec<String>,
    pub states: Vec<StateEntry>,
}

static CORPUS: OnceLock<RandomCorpus> = OnceLock::new();

pub fn corpus() -> &'static RandomCorpus {
    CORPUS.get_or_init(|| {
        serde_json::from_str(CORPUS_JSON).expect("bundled data/data.json is valid")
    })
}

fn pick<'a, R: Rng + ?Sized>(rng: &mut R, list: &'a [String]) -> &'a str {
    list.choose(rng).map(String::as_str).unwrap_or("")
}

fn digits<R: Rng + ?Sized>(rng: &mut R, n: usize) -> String {
    (0..n)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

pub fn present_year() -> i32 {
    Local::now().year()
}

// -----------------------------------------------------------------------------
// Names and places
// -----------------------------------------------------------------------------

pub fn first_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let names = corpus();
    let list = if rng.random_bool(0.5) {
        &names.first_names.male
    } else {
        &names.first_names.female
    };
    pick(rng, list).to_string()
}

pub fn last_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    pick(rng, &corpus().last_names).to_string()
}

pub fn address<R: Rng + ?Sized>(rng: &mut R) -> String {
    let c = corpus();
    let number_len = rng.random_range(1..=5);
    let mut number = digits(rng, number_len);
    if number.starts_with('0') {
        number.replace_range(0..1, "1");
    }
    format!(
        "{} {} {}",
        number,
        pick(rng, &c.street_names),
        pick(rng, &c.street_suffixes)
    )
}

pub fn city<R: Rng + ?Sized>(rng: &mut R) -> String {
    pick(rng, &corpus().cities).to_string()
}

pub fn state<R: Rng + ?Sized>(rng: &mut R) -> String {
    corpus()
        .states
        .choose(rng)
        .map(|s| s.code.clone())
        .unwrap_or_default()
}

pub fn email(first: &str, last: &str) -> String {
    format!("{}.{}@example.com", first, last).to_lowercase()
}

pub fn username<R: Rng + ?Sized>(rng: &mut R, first: &str, last: &str) -> String {
    format!("{}{}{}", first, last, digits(rng, 4)).to_lowercase()
}

pub fn nickname(first: &str, last: &str) -> String {
    let initial: String = first.chars().take(1).collect();
    format!("{}{}", initial, last).to_lowercase()
}

// -----------------------------------------------------------------------------
// Numbers and identifiers
// -----------------------------------------------------------------------------

pub fn phone<R: Rng + ?Sized>(rng: &mut R) -> String {
    let area = pick(rng, &corpus().area_codes).to_string();
    format!("{}-{}-{}", area, digits(rng, 3), digits(rng, 4))
}

pub fn zip_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, 5)
}

pub fn four<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, 4)
}

pub fn account<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, 10)
}

pub fn id<R: Rng + ?Sized>(rng: &mut R) -> String {
    digits(rng, 16)
}

pub fn ssn<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{}-{}-{}", digits(rng, 3), digits(rng, 2), digits(rng, 4))
}

pub fn credit_card<R: Rng + ?Sized>(rng: &mut R) -> String {
    let mask = pick(rng, &corpus().credit_card_masks).to_string();
    let filled: Vec<char> = mask
        .chars()
        .map(|c| {
            if c == '#' {
                char::from(b'0' + rng.random_range(0..10u8))
            } else {
                c
            }
        })
        .collect();
    filled
        .chunks(4)
        .map(|g| g.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn dollar<R: Rng + ?Sized>(rng: &mut R) -> String {
    let int_digits = rng.random_range(1..=5u32);
    let upper = 10u32.pow(int_digits);
    let lower = if int_digits == 1 { 0 } else { 10u32.pow(int_digits - 1) };
    format!("{}.{:02}", rng.random_range(lower..upper), rng.random_range(0..100u32))
}

pub fn hash<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.sample_iter(Alphanumeric).take(16).map(char::from).collect()
}

pub fn boolean<R: Rng + ?Sized>(rng: &mut R) -> bool {
    rng.random_bool(0.5)
}

// -----------------------------------------------------------------------------
// Calendar
// -----------------------------------------------------------------------------

pub fn year<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    rng.random_range(FIRST_YEAR..=present_year())
}

/// Month number 1..=12
pub fn month<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    rng.random_range(1..=12)
}

pub fn days_in_month(month: u32) -> u32 {
    DAYS_IN_MONTH[((month.clamp(1, 12)) - 1) as usize]
}

pub fn day<R: Rng + ?Sized>(rng: &mut R, month: u32) -> u32 {
    rng.random_range(1..=days_in_month(month))
}

/// A calendar date expressed as (year, month, day).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFormat {
    /// MM/DD/YYYY
    Slash,
    /// MM-DD-YYYY
    Dash,
    /// Mon DD YYYY
    Abbrev,
}

impl SimpleDate {
    pub fn format(&self, fmt: DateFormat) -> String {
        match fmt {
            DateFormat::Slash => format!("{:02}/{:02}/{:04}", self.month, self.day, self.year),
            DateFormat::Dash => format!("{:02}-{:02}-{:04}", self.month, self.day, self.year),
            DateFormat::Abbrev => format!(
                "{} {:02} {:04}",
                MONTH_ABBREV[(self.month - 1) as usize],
                self.day,
                self.year
            ),
        }
    }
}

/// A date in a year strictly before the present one.
pub fn past_date<R: Rng + ?Sized>(rng: &mut R) -> SimpleDate {
    let y = rng.random_range(FIRST_YEAR..present_year());
    let m = month(rng);
    SimpleDate { year: y, month: m, day: day(rng, m) }
}

/// A date at least twenty years before the present year.
pub fn dob<R: Rng + ?Sized>(rng: &mut R) -> SimpleDate {
    let y = rng.random_range(FIRST_YEAR..=present_year() - 20);
    let m = month(rng);
    SimpleDate { year: y, month: m, day: day(rng, m) }
}

pub fn date_time() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// -----------------------------------------------------------------------------
// Image
// -----------------------------------------------------------------------------

/// Random-pixel 24-bit BMP, base64 encoded.
pub fn image<R: Rng + ?Sized>(rng: &mut R) -> String {
    let row = IMAGE_SIDE * 3;
    let pixels = row * IMAGE_SIDE;
    let file_size = 54 + pixels;

    let mut buf = Vec::with_capacity(file_size);
    buf.extend_from_slice(b"BM");
    buf.extend_from_slice(&(file_size as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&54u32.to_le_bytes());
    // BITMAPINFOHEADER
    buf.extend_from_slice(&40u32.to_le_bytes());
    buf.extend_from_slice(&(IMAGE_SIDE as i32).to_le_bytes());
    buf.extend_from_slice(&(IMAGE_SIDE as i32).to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.extend_from_slice(&24u16.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&(pixels as u32).to_le_bytes());
    buf.extend_from_slice(&2835i32.to_le_bytes());
    buf.extend_from_slice(&2835i32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());

    let start = buf.len();
    buf.resize(start + pixels, 0);
    rng.fill(&mut buf[start..]);

    base64::engine::general_purpose::STANDARD.encode(&buf)
}

// -----------------------------------------------------------------------------
// Counters
// -----------------------------------------------------------------------------

static INCREMENTOR: AtomicU64 = AtomicU64::new(0);
static BLOCKS: OnceLock<Arc<AtomicU64>> = OnceLock::new();

/// Process-wide counter; every call returns a value larger than any before it.
pub fn next_incrementor() -> u64 {
    INCREMENTOR.fetch_add(1, Ordering::SeqCst) + 1
}

/// Hands out values from blocks of `set_size` reserved from a shared block
/// counter, so many holders can count without touching the shared atomic on
/// every call. Values from one holder are strictly increasing and no two
/// holders sharing a block counter ever return the same value.
#[derive(Debug)]
pub struct BlockIncrementor {
    blocks: Arc<AtomicU64>,
    set_size: u64,
    next: u64,
    end: u64,
}

impl BlockIncrementor {
    /// Holder drawing from the process-wide block counter.
    pub fn new(set_size: u64) -> Self {
        let blocks = BLOCKS.get_or_init(|| Arc::new(AtomicU64::new(0))).clone();
        Self::with_counter(blocks, set_size)
    }

    pub fn with_counter(blocks: Arc<AtomicU64>, set_size: u64) -> Self {
        Self {
            blocks,
            set_size: set_size.max(1),
            next: 0,
            end: 0,
        }
    }

    pub fn next_value(&mut self) -> u64 {
        if self.next >= self.end {
            let block = self.blocks.fetch_add(1, Ordering::SeqCst);
            self.next = block * self.set_size + 1;
            self.end = self.next + self.set_size;
        }
        let v = self.next;
        self.next += 1;
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::collections::HashSet;

    fn check(pattern: &str, mut f: impl FnMut() -> String) {
        let re = Regex::new(pattern).unwrap();
        for _ in 0..500 {
            let v = f();
            assert!(re.is_match(&v), "{:?} does not match {}", v, pattern);
        }
    }

    #[test]
    fn test_corpus_loads() {
        let c = corpus();
        assert!(!c.first_names.male.is_empty());
        assert!(!c.first_names.female.is_empty());
        assert_eq!(c.states.len(), 50);
        assert!(c.credit_card_masks.iter().all(|m| m.len() == 16));
    }

    #[test]
    fn test_field_shapes() {
        let mut r = rand::rng();
        check(r"^[A-Za-z]+$", || first_name(&mut r));
        check(r"^[A-Za-z]+$", || last_name(&mut r));
        check(r"^[1-9][0-9]{0,4} [A-Za-z]+ [A-Za-z]+$", || address(&mut r));
        check(r"^[0-9]{3}-[0-9]{3}-[0-9]{4}$", || phone(&mut r));
        check(r"^[0-9]{5}$", || zip_code(&mut r));
        check(r"^[0-9]{4}$", || four(&mut r));
        check(r"^[0-9]{10}$", || account(&mut r));
        check(r"^[0-9]{16}$", || id(&mut r));
        check(r"^[0-9]{3}-[0-9]{2}-[0-9]{4}$", || ssn(&mut r));
        check(r"^[0-9]{4}-[0-9]{4}-[0-9]{4}-[0-9]{4}$", || credit_card(&mut r));
        check(r"^[0-9]{1,5}\.[0-9]{2}$", || dollar(&mut r));
        check(r"^[A-Za-z0-9]{16}$", || hash(&mut r));
        check(r"^[A-Z]{2}$", || state(&mut r));
    }

    #[test]
    fn test_phone_area_code_from_corpus() {
        let mut r = rand::rng();
        let codes: HashSet<&str> = corpus().area_codes.iter().map(String::as_str).collect();
        for _ in 0..200 {
            let p = phone(&mut r);
            assert!(codes.contains(&p[..3]));
        }
    }

    #[test]
    fn test_card_prefix_matches_mask() {
        let mut r = rand::rng();
        for _ in 0..200 {
            let card = credit_card(&mut r).replace('-', "");
            let ok = corpus().credit_card_masks.iter().any(|mask| {
                mask.chars().zip(card.chars()).all(|(m, c)| m == '#' || m == c)
            });
            assert!(ok, "{} matches no mask", card);
        }
    }

    #[test]
    fn test_calendar_ranges() {
        let mut r = rand::rng();
        let now = present_year();
        for _ in 0..1000 {
            let y = year(&mut r);
            assert!((FIRST_YEAR..=now).contains(&y));
            let m = month(&mut r);
            assert!((1..=12).contains(&m));
            let d = day(&mut r, m);
            assert!(d >= 1 && d <= days_in_month(m));
            let p = past_date(&mut r);
            assert!(p.year < now);
            let b = dob(&mut r);
            assert!(b.year <= now - 20);
        }
        assert_eq!(days_in_month(2), 28);
    }

    #[test]
    fn test_date_formats() {
        let d = SimpleDate { year: 1999, month: 3, day: 7 };
        assert_eq!(d.format(DateFormat::Slash), "03/07/1999");
        assert_eq!(d.format(DateFormat::Dash), "03-07-1999");
        assert_eq!(d.format(DateFormat::Abbrev), "Mar 07 1999");
        check(r"^[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}$", date_time);
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(email("Mary", "Smith"), "mary.smith@example.com");
        assert_eq!(nickname("Mary", "Smith"), "msmith");
        let mut r = rand::rng();
        check(r"^marysmith[0-9]{4}$", || username(&mut r, "Mary", "Smith"));
    }

    #[test]
    fn test_image_is_128_square_bmp() {
        let mut r = rand::rng();
        let encoded = image(&mut r);
        let raw = base64::engine::general_purpose::STANDARD.decode(encoded).unwrap();
        assert_eq!(&raw[..2], b"BM");
        assert_eq!(raw.len(), 54 + 128 * 128 * 3);
        assert_eq!(i32::from_le_bytes([raw[18], raw[19], raw[20], raw[21]]), 128);
    }

    #[test]
    fn test_incrementors_strictly_increase() {
        let a = next_incrementor();
        let b = next_incrementor();
        assert!(b > a);

        let shared = Arc::new(AtomicU64::new(0));
        let mut x = BlockIncrementor::with_counter(shared.clone(), 3);
        let mut y = BlockIncrementor::with_counter(shared, 3);
        let xs: Vec<u64> = (0..5).map(|_| x.next_value()).collect();
        let ys: Vec<u64> = (0..5).map(|_| y.next_value()).collect();
        assert!(xs.windows(2).all(|w| w[1] > w[0]));
        assert!(ys.windows(2).all(|w| w[1] > w[0]));
        let all: HashSet<u64> = xs.iter().chain(ys.iter()).copied().collect();
        assert_eq!(all.len(), 10);
        assert_eq!(xs[..3], [1, 2, 3]);
        assert_eq!(ys[..3], [4, 5, 6]);
    }
}
