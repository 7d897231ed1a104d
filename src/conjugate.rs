//! # Verb Conjugation
//!
//! Verbs in MorphDB are morphological: a base verb like `close` yields the
//! triple (`close`, `closing`, `closed`): action, activity, and event forms.
//! The action form names the operation, the activity form names work in
//! flight, and the event form names what the event log records
//! (`Deal.close` events carry event form `closed`). The event form also
//! derives the reverse-relation names `closedBy` / `closedAt`.
//!
//! The conjugator is consulted twice: at schema registration (to populate
//! each verb's triple on the noun) and at event emission (to fill the event's
//! conjugation columns from the base verb).
//!
//! ## Algorithm
//!
//! An irregular-verb table wins outright; otherwise suffix rules apply:
//!
//! - **Third person**: `s|x|z|ch|sh` endings take `es`; consonant+`y` drops
//!   the `y` for `ies`; everything else takes `s`.
//! - **Gerund**: `ie` becomes `ying`; a trailing `e` (but not `ee`) is
//!   dropped before `ing`; short CVC-ending words double the final consonant.
//! - **Past participle**: trailing `e` takes `d`; consonant+`y` becomes
//!   `ied`; short CVC-ending words double the final consonant before `ed`.
//!
//! Consonant doubling only applies to words of six letters or fewer, and
//! never doubles `w`, `x`, or `y`.

use serde::{Deserialize, Serialize};

// =============================================================================
// Irregular Verbs
// =============================================================================

/// Irregular verbs: (base, third person, gerund, past participle).
///
/// Consulted before any suffix rule. The set covers the business verbs that
/// show up in entity schemas; a regular verb never needs an entry.
const IRREGULAR: &[(&str, &str, &str, &str)] = &[
    ("buy", "buys", "buying", "bought"),
    ("find", "finds", "finding", "found"),
    ("get", "gets", "getting", "got"),
    ("hold", "holds", "holding", "held"),
    ("keep", "keeps", "keeping", "kept"),
    ("leave", "leaves", "leaving", "left"),
    ("lose", "loses", "losing", "lost"),
    ("make", "makes", "making", "made"),
    ("meet", "meets", "meeting", "met"),
    ("pay", "pays", "paying", "paid"),
    ("run", "runs", "running", "run"),
    ("sell", "sells", "selling", "sold"),
    ("send", "sends", "sending", "sent"),
    ("set", "sets", "setting", "set"),
    ("win", "wins", "winning", "won"),
];

fn irregular(base: &str) -> Option<&'static (&'static str, &'static str, &'static str, &'static str)> {
    IRREGULAR.iter().find(|(b, _, _, _)| *b == base)
}

// =============================================================================
// Conjugation Triple
// =============================================================================

/// The conjugation of a verb: action, activity, and event forms.
///
/// Stored on every verb of a noun schema and denormalized onto every event
/// row, so events remain self-describing even if the schema is replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conjugation {
    /// The base verb; the canonical form operations are invoked with.
    pub action: String,
    /// Gerund form, e.g. `closing`.
    pub activity: String,
    /// Past participle, e.g. `closed`; also the event log's vocabulary.
    pub event: String,
}

impl Conjugation {
    /// Reverse-relation name pointing at the actor: `closedBy`.
    pub fn reverse_by(&self) -> String {
        format!("{}By", self.event)
    }

    /// Reverse-relation name pointing at the time: `closedAt`.
    pub fn reverse_at(&self) -> String {
        format!("{}At", self.event)
    }
}

/// Conjugates a lowercase base verb into its full triple.
pub fn conjugate(base: &str) -> Conjugation {
    if let Some((_, _, gerund, past)) = irregular(base) {
        return Conjugation {
            action: base.to_string(),
            activity: (*gerund).to_string(),
            event: (*past).to_string(),
        };
    }
    Conjugation {
        action: base.to_string(),
        activity: gerund(base),
        event: past_participle(base),
    }
}

// =============================================================================
// Suffix Rules
// =============================================================================

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

/// True when the word ends consonant-vowel-consonant with a doublable final
/// consonant (`w`, `x`, `y` never double).
fn ends_cvc(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    let n = chars.len();
    if n < 3 {
        return false;
    }
    let (a, b, c) = (chars[n - 3], chars[n - 2], chars[n - 1]);
    !is_vowel(a) && is_vowel(b) && !is_vowel(c) && !matches!(c, 'w' | 'x' | 'y')
}

fn double_final(word: &str) -> String {
    let last = word.chars().last().expect("non-empty verb");
    format!("{}{}", word, last)
}

fn ends_consonant_y(word: &str) -> bool {
    let chars: Vec<char> = word.chars().collect();
    let n = chars.len();
    n >= 2 && chars[n - 1] == 'y' && !is_vowel(chars[n - 2])
}

/// Third-person singular form: `qualify` → `qualifies`, `watch` → `watches`.
///
/// Not part of the stored triple; the routing layer uses it for resource
/// naming.
pub fn third_person(base: &str) -> String {
    if let Some((_, third, _, _)) = irregular(base) {
        return (*third).to_string();
    }
    if base.ends_with('s')
        || base.ends_with('x')
        || base.ends_with('z')
        || base.ends_with("ch")
        || base.ends_with("sh")
    {
        format!("{}es", base)
    } else if ends_consonant_y(base) {
        format!("{}ies", &base[..base.len() - 1])
    } else {
        format!("{}s", base)
    }
}

/// Gerund form: `close` → `closing`, `tie` → `tying`, `ship` → `shipping`.
fn gerund(base: &str) -> String {
    // `ie` endings are checked before the generic `e` rule; every `ie` word
    // also ends in `e`, so the order matters.
    if base.ends_with("ie") {
        format!("{}ying", &base[..base.len() - 2])
    } else if base.ends_with('e') && !base.ends_with("ee") {
        format!("{}ing", &base[..base.len() - 1])
    } else if ends_cvc(base) && base.len() <= 6 {
        format!("{}ing", double_final(base))
    } else {
        format!("{}ing", base)
    }
}

/// Past participle: `close` → `closed`, `qualify` → `qualified`.
fn past_participle(base: &str) -> String {
    if base.ends_with('e') {
        format!("{}d", base)
    } else if ends_consonant_y(base) {
        format!("{}ied", &base[..base.len() - 1])
    } else if ends_cvc(base) && base.len() <= 6 {
        format!("{}ed", double_final(base))
    } else {
        format!("{}ed", base)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(base: &str) -> (String, String, String) {
        let c = conjugate(base);
        (c.action, c.activity, c.event)
    }

    #[test]
    fn test_default_verbs() {
        assert_eq!(
            triple("create"),
            ("create".into(), "creating".into(), "created".into())
        );
        assert_eq!(
            triple("update"),
            ("update".into(), "updating".into(), "updated".into())
        );
        assert_eq!(
            triple("delete"),
            ("delete".into(), "deleting".into(), "deleted".into())
        );
    }

    #[test]
    fn test_e_drop() {
        assert_eq!(
            triple("close"),
            ("close".into(), "closing".into(), "closed".into())
        );
        assert_eq!(
            triple("archive"),
            ("archive".into(), "archiving".into(), "archived".into())
        );
    }

    #[test]
    fn test_double_e_keeps_e() {
        assert_eq!(
            triple("agree"),
            ("agree".into(), "agreeing".into(), "agreed".into())
        );
    }

    #[test]
    fn test_consonant_y() {
        assert_eq!(
            triple("qualify"),
            ("qualify".into(), "qualifying".into(), "qualified".into())
        );
        assert_eq!(third_person("qualify"), "qualifies");
    }

    #[test]
    fn test_vowel_y_untouched() {
        assert_eq!(
            triple("deploy"),
            ("deploy".into(), "deploying".into(), "deployed".into())
        );
        assert_eq!(third_person("deploy"), "deploys");
    }

    #[test]
    fn test_cvc_doubling() {
        assert_eq!(
            triple("ship"),
            ("ship".into(), "shipping".into(), "shipped".into())
        );
        assert_eq!(triple("plan").1, "planning");
        // w/x/y never double
        assert_eq!(triple("snow").1, "snowing");
        assert_eq!(triple("fix").1, "fixing");
        // long words don't double
        assert_eq!(triple("deliver").1, "delivering");
    }

    #[test]
    fn test_ie_becomes_ying() {
        assert_eq!(triple("tie"), ("tie".into(), "tying".into(), "tied".into()));
    }

    #[test]
    fn test_third_person_sibilants() {
        assert_eq!(third_person("watch"), "watches");
        assert_eq!(third_person("push"), "pushes");
        assert_eq!(third_person("pass"), "passes");
        assert_eq!(third_person("fix"), "fixes");
        assert_eq!(third_person("buzz"), "buzzes");
        assert_eq!(third_person("close"), "closes");
    }

    #[test]
    fn test_irregulars_win() {
        assert_eq!(triple("send"), ("send".into(), "sending".into(), "sent".into()));
        assert_eq!(triple("pay"), ("pay".into(), "paying".into(), "paid".into()));
        assert_eq!(triple("win"), ("win".into(), "winning".into(), "won".into()));
        assert_eq!(triple("set"), ("set".into(), "setting".into(), "set".into()));
        assert_eq!(third_person("get"), "gets");
    }

    #[test]
    fn test_reverse_relation_names() {
        let c = conjugate("close");
        assert_eq!(c.reverse_by(), "closedBy");
        assert_eq!(c.reverse_at(), "closedAt");
        let q = conjugate("qualify");
        assert_eq!(q.reverse_by(), "qualifiedBy");
        assert_eq!(q.reverse_at(), "qualifiedAt");
    }
}
