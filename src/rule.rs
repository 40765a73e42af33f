// byte level substitution rules, the `s/from/to[/count]` command language
// patterns are binary: a `%` followed by two hex digits stands for one byte of
// that value, `%%` stands for a literal `%`. both sides of a rule go through
// the same decoding, so delimiters and unprintable bytes can appear in either
// the engine below is a single greedy left-to-right pass. replacement output
// is never rescanned, the cursor steps over whatever a rule inserted, which
// also bounds the work per chunk and rules out empty-match loops (the parser
// rejects an empty source pattern)

use std::str::FromStr;

use tracing::{debug, info};

pub const UNLIMITED: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub from: Vec<u8>,
    pub to: Vec<u8>,
    // -1 for unlimited, otherwise the number of applications granted to each
    // connection
    pub count: i32,
    // undecoded pattern text, only for diagnostics
    from_text: String,
    to_text: String,
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s/{}/{}", self.from_text, self.to_text)
    }
}

fn decode_pattern(text: &str) -> anyhow::Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut pattern = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            pattern.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            // `%%` is a literal `%`, two characters long. whatever follows it
            // is ordinary input again
            pattern.push(b'%');
            i += 2;
            continue;
        }
        let (Some(&high), Some(&low)) = (bytes.get(i + 1), bytes.get(i + 2)) else {
            anyhow::bail!("unexpected end of %-escape")
        };
        let digit = |b: u8| (b as char).to_digit(16);
        let (Some(high), Some(low)) = (digit(high), digit(low)) else {
            anyhow::bail!("non-hex %-escape sequence")
        };
        pattern.push((high * 16 + low) as u8);
        i += 3
    }
    Ok(pattern)
}

// the fields are split before decoding, so an unescaped `/` always acts as a
// delimiter and a `%2f` never does. the split only needs to know how many
// characters each escape spans, decoding validates the digits afterwards
fn split_field(text: &str) -> (&str, Option<&str>) {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' => return (&text[..i], Some(&text[i + 1..])),
            b'%' if bytes.get(i + 1) == Some(&b'%') => i += 2,
            b'%' => i += 3,
            _ => i += 1,
        }
    }
    (text, None)
}

impl FromStr for Rule {
    type Err = anyhow::Error;

    fn from_str(spec: &str) -> anyhow::Result<Self> {
        let Some(body) = spec.strip_prefix("s/") else {
            anyhow::bail!("rule {spec:?} does not start with s/")
        };
        let (from_text, rest) = split_field(body);
        // decode before insisting on the delimiter: a truncated escape eats
        // the `/` that was meant to end the field, and the escape is the error
        // worth reporting
        let from = decode_pattern(from_text)
            .map_err(|err| err.context(format!("malformed source pattern in rule {spec:?}")))?;
        if from.is_empty() {
            anyhow::bail!("empty source pattern in rule {spec:?}")
        }
        let Some(rest) = rest else {
            anyhow::bail!("rule {spec:?} has no destination pattern")
        };
        let (to_text, count_text) = split_field(rest);
        let to = decode_pattern(to_text)
            .map_err(|err| err.context(format!("malformed destination pattern in rule {spec:?}")))?;
        // an absent, empty or non-positive count grants unlimited applications
        let count = count_text
            .map(|text| {
                let digits: &str = &text[..text.bytes().take_while(u8::is_ascii_digit).count()];
                digits.parse::<i32>().unwrap_or(0)
            })
            .filter(|count| *count > 0)
            .unwrap_or(UNLIMITED);
        Ok(Self {
            from,
            to,
            count,
            from_text: from_text.into(),
            to_text: to_text.into(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet(Vec<Rule>);

impl RuleSet {
    pub fn parse<S: AsRef<str>>(specs: impl IntoIterator<Item = S>) -> anyhow::Result<Self> {
        let rules = specs
            .into_iter()
            .map(|spec| spec.as_ref().parse())
            .collect::<anyhow::Result<Vec<Rule>>>()?;
        if rules.is_empty() {
            anyhow::bail!("no rule given")
        }
        for rule in &rules {
            info!(
                "loaded rule {rule} ({} -> {} bytes, count {})",
                rule.from.len(),
                rule.to.len(),
                rule.count
            )
        }
        Ok(Self(rules))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // the per-connection mutable counters. every flow starts from the same
    // snapshot and burns its own copy down
    pub fn initial_counts(&self) -> Vec<i32> {
        self.0.iter().map(|rule| rule.count).collect()
    }

    // rewrite one chunk into `out`, consuming applications from `live`.
    // `live` must be a counts vector handed out by `initial_counts`. at every
    // position the first rule that is not expired and matches wins, rule order
    // is priority order. returns the number of substitutions performed
    pub fn rewrite(&self, input: &[u8], live: &mut [i32], out: &mut Vec<u8>) -> usize {
        assert_eq!(live.len(), self.0.len());
        out.clear();
        let mut applied = 0;
        let mut i = 0;
        while i < input.len() {
            let hit = self
                .0
                .iter()
                .enumerate()
                .find(|(j, rule)| live[*j] != 0 && input[i..].starts_with(&rule.from));
            let Some((j, rule)) = hit else {
                out.push(input[i]);
                i += 1;
                continue;
            };
            info!("    applying rule {rule}");
            out.extend_from_slice(&rule.to);
            i += rule.from.len();
            applied += 1;
            if live[j] > 0 {
                live[j] -= 1;
                if live[j] == 0 {
                    info!("    rule {rule} expired for this connection")
                }
            }
        }
        if applied == 0 {
            debug!("chunk of {} bytes passed through untouched", input.len())
        } else {
            info!(
                "chunk of {} bytes rewritten to {} bytes, {applied} replacements",
                input.len(),
                out.len()
            )
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(spec: &str) -> Rule {
        spec.parse().unwrap()
    }

    #[test]
    fn parse_basic() {
        let rule = rule("s/andrew/mike");
        assert_eq!(rule.from, b"andrew");
        assert_eq!(rule.to, b"mike");
        assert_eq!(rule.count, UNLIMITED)
    }

    #[test]
    fn parse_count() {
        assert_eq!(rule("s/andrew/mike/3").count, 3);
        // non-positive or malformed counts all mean unlimited
        assert_eq!(rule("s/andrew/mike/0").count, UNLIMITED);
        assert_eq!(rule("s/andrew/mike/-2").count, UNLIMITED);
        assert_eq!(rule("s/andrew/mike/").count, UNLIMITED);
        assert_eq!(rule("s/andrew/mike/many").count, UNLIMITED)
    }

    #[test]
    fn parse_empty_destination() {
        assert_eq!(rule("s/andrew/").to, b"");
        assert_eq!(rule("s/andrew//2").to, b"")
    }

    #[test]
    fn parse_escapes() {
        assert_eq!(rule("s/%41%6a/x").from, b"Aj");
        assert_eq!(rule("s/%2f/%25").from, b"/");
        assert_eq!(rule("s/%2f/%25").to, b"%");
        assert_eq!(rule("s/a%%b/x").from, b"a%b");
        // `%%` spans two characters, a slash right after it still delimits
        let rule = rule("s/a%%/x");
        assert_eq!(rule.from, b"a%");
        assert_eq!(rule.to, b"x")
    }

    #[test]
    fn parse_rejects() {
        assert!("x/a/b".parse::<Rule>().is_err());
        assert!("s".parse::<Rule>().is_err());
        assert!("s/a".parse::<Rule>().is_err());
        assert!("s//b".parse::<Rule>().is_err());
        assert!("s/a%".parse::<Rule>().is_err());
        assert!("s/a%2/b".parse::<Rule>().is_err());
        assert!("s/a/b%g1".parse::<Rule>().is_err())
    }

    #[test]
    fn parse_error_names_the_side() {
        let err = "s/%zz/b".parse::<Rule>().unwrap_err();
        assert!(format!("{err:#}").contains("source"));
        let err = "s/a/%zz".parse::<Rule>().unwrap_err();
        assert!(format!("{err:#}").contains("destination"))
    }

    fn run(set: &RuleSet, live: &mut [i32], input: &[u8]) -> (Vec<u8>, usize) {
        let mut out = Vec::new();
        let applied = set.rewrite(input, live, &mut out);
        (out, applied)
    }

    #[test]
    fn rewrite_greedy_non_overlapping() {
        let set = RuleSet::parse(["s/aa/b"]).unwrap();
        let (out, applied) = run(&set, &mut set.initial_counts(), b"aaa");
        assert_eq!(out, b"ba");
        assert_eq!(applied, 1)
    }

    #[test]
    fn rewrite_first_rule_wins() {
        let set = RuleSet::parse(["s/ab/1", "s/a/2"]).unwrap();
        assert_eq!(run(&set, &mut set.initial_counts(), b"ab").0, b"1");
        // earlier rule wins even when a later one matches longer
        let set = RuleSet::parse(["s/a/2", "s/ab/1"]).unwrap();
        assert_eq!(run(&set, &mut set.initial_counts(), b"ab").0, b"2b")
    }

    #[test]
    fn rewrite_honors_counts() {
        let set = RuleSet::parse(["s/andrew/mike/1"]).unwrap();
        let mut live = set.initial_counts();
        let (out, applied) = run(&set, &mut live, b"test andrew and andrew");
        assert_eq!(out, b"test mike and andrew");
        assert_eq!(applied, 1);
        assert_eq!(live, [0])
    }

    #[test]
    fn rewrite_skips_expired() {
        let set = RuleSet::parse(["s/a/x/1"]).unwrap();
        let mut live = vec![0];
        let (out, applied) = run(&set, &mut live, b"aaa");
        assert_eq!(out, b"aaa");
        assert_eq!(applied, 0)
    }

    #[test]
    fn rewrite_preserves_unlimited() {
        let set = RuleSet::parse(["s/a/x"]).unwrap();
        let mut live = set.initial_counts();
        run(&set, &mut live, b"aaaa");
        assert_eq!(live, [UNLIMITED])
    }

    #[test]
    fn rewrite_identity_without_matches() {
        let set = RuleSet::parse(["s/%00%01/x"]).unwrap();
        let input = [0u8, 2, 255, 0, 254, 1];
        let (out, applied) = run(&set, &mut set.initial_counts(), &input);
        assert_eq!(out, input);
        assert_eq!(applied, 0);
        assert_eq!(run(&set, &mut set.initial_counts(), b"").0, b"")
    }

    #[test]
    fn hex_escape_round_trip() {
        for value in 0..=255u8 {
            let set = RuleSet::parse([format!("s/%{value:02x}/%{value:02X}")]).unwrap();
            let (out, applied) = run(&set, &mut set.initial_counts(), &[value]);
            assert_eq!(applied, 1, "byte {value:#04x}");
            assert_eq!(out, [value])
        }
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            // with unlimited counts and replacement bytes disjoint from the
            // pattern alphabet, a second pass finds nothing: the engine never
            // rescans what it substituted
            #[test]
            fn unlimited_rewrite_is_stable(
                from1 in "[ab]{1,3}",
                to1 in "[xy]{1,3}",
                from2 in "[ab]{1,3}",
                to2 in "[xy]{1,3}",
                input in "[abxy]{0,60}",
            ) {
                let set =
                    RuleSet::parse([format!("s/{from1}/{to1}"), format!("s/{from2}/{to2}")])
                        .unwrap();
                let mut live = set.initial_counts();
                let mut once = Vec::new();
                set.rewrite(input.as_bytes(), &mut live, &mut once);
                let mut twice = Vec::new();
                set.rewrite(&once, &mut live, &mut twice);
                prop_assert_eq!(once, twice)
            }

            #[test]
            fn count_bounds_applications(k in 0usize..8, n in 1i32..6) {
                let set = RuleSet::parse([format!("s/ab/z/{n}")]).unwrap();
                let input = "ab".repeat(k);
                let mut live = set.initial_counts();
                let mut out = Vec::new();
                let applied = set.rewrite(input.as_bytes(), &mut live, &mut out);
                let expect = k.min(n as usize);
                prop_assert_eq!(applied, expect);
                prop_assert_eq!(live[0], n - expect as i32);
                let survived = "ab".repeat(k - expect);
                prop_assert_eq!(out, format!("{}{survived}", "z".repeat(expect)).into_bytes())
            }

            #[test]
            fn no_match_is_identity(input in "[cd]{0,60}") {
                let set = RuleSet::parse(["s/ab/xy"]).unwrap();
                let mut out = Vec::new();
                let applied =
                    set.rewrite(input.as_bytes(), &mut set.initial_counts(), &mut out);
                prop_assert_eq!(applied, 0);
                prop_assert_eq!(out, input.into_bytes())
            }
        }
    }
}
