//! Typed entity matchers
//!
//! Each matcher scans the whole question and reports every candidate span it
//! recognises together with the template text that replaces it and the
//! canonical parameter values it binds. Matchers never mutate the question;
//! overlap between candidates is settled afterwards by the extractor.

use super::lexicon::{self, params, IDENTITY_SENTINEL};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

/// Entity categories, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    FamilyRelation,
    Subject,
    EvaluationType,
    Term,
    NamePair,
    ClassCode,
    SchoolYear,
    Weekday,
    PersonId,
    QuotedValue,
}

/// One recognised span of the input question.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub start: usize,
    pub end: usize,
    pub kind: EntityKind,
    /// Template text written in place of the span.
    pub replacement: String,
    /// Parameter name -> canonical value.
    pub bindings: Vec<(String, String)>,
}

impl Candidate {
    fn new(
        start: usize,
        end: usize,
        kind: EntityKind,
        replacement: impl Into<String>,
        bindings: Vec<(&str, String)>,
    ) -> Self {
        Self {
            start,
            end,
            kind,
            replacement: replacement.into(),
            bindings: bindings
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        }
    }

    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

pub trait Matcher: Send + Sync {
    fn kind(&self) -> EntityKind;
    fn candidates(&self, text: &str) -> Vec<Candidate>;
}

const SCHOOL_YEAR_PATTERN: &str = r"\b20\d{2}[/-]20\d{2}\b";
const PLACEHOLDER_PATTERN: &str = r"\{\{?\w+\}?\}";

lazy_static! {
    static ref FAMILY_RE: Regex = Regex::new(lexicon::FAMILY_PATTERN).unwrap();
    static ref SUBJECT_RES: Vec<Regex> = lexicon::SUBJECT_PATTERNS
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();
    static ref EVALUATION_RES: Vec<Regex> = lexicon::EVALUATION_PATTERNS
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect();
    static ref TERM_RES: Vec<(Regex, &'static str)> = lexicon::TERM_PATTERNS
        .iter()
        .map(|(p, code)| (Regex::new(p).unwrap(), *code))
        .collect();
    static ref UPPER_TOKEN_RE: Regex = Regex::new(r"\b[A-ZÀ-ÖØ-Þ]{3,}\b").unwrap();
    static ref CLASS_CODE_RE: Regex = Regex::new(r"\b\d+[A-Z]\d+\b").unwrap();
    static ref SCHOOL_YEAR_RE: Regex = Regex::new(SCHOOL_YEAR_PATTERN).unwrap();
    static ref WEEKDAY_RE: Regex =
        Regex::new(&format!(r"(?i)\b(?:{})\b", lexicon::WEEKDAYS.join("|"))).unwrap();
    static ref RELATIVE_DAY_RES: Vec<(Regex, &'static str)> = lexicon::RELATIVE_DAYS
        .iter()
        .map(|(p, expr)| (Regex::new(p).unwrap(), *expr))
        .collect();
    static ref NUMBER_RE: Regex =
        Regex::new(&format!(r"\b\d{{{},}}\b", lexicon::MIN_ID_DIGITS)).unwrap();
    static ref QUOTED_RE: Regex = Regex::new(r#"'([^'"]+)'|"([^'"]+)""#).unwrap();
    static ref CONTEXT_TOKEN_RE: Regex = Regex::new(r"n°|#|\w+").unwrap();
    /// Phrases the extractor turns into one placeholder, and the placeholders.
    static ref ENTITY_SPAN_RES: Vec<Regex> = std::iter::once(lexicon::FAMILY_PATTERN)
        .chain(lexicon::SUBJECT_PATTERNS.iter().copied())
        .chain(lexicon::EVALUATION_PATTERNS.iter().copied())
        .chain(lexicon::TERM_PATTERNS.iter().map(|(p, _)| *p))
        .chain(lexicon::RELATIVE_DAYS.iter().map(|(p, _)| *p))
        .chain([SCHOOL_YEAR_PATTERN, PLACEHOLDER_PATTERN])
        .map(|p| Regex::new(p).unwrap())
        .collect();
    static ref NOM_WORD_RE: Regex = Regex::new(r"(?i)\bnoms?\b").unwrap();
    static ref TRAILING_NUMBER_RE: Regex = Regex::new(r"^(.*?)\s*(\d+)$").unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
}

/// "mon fils", "ma fille", ... -> `{family_relation}`.
pub struct FamilyMatcher;

impl Matcher for FamilyMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::FamilyRelation
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        FAMILY_RE
            .find_iter(text)
            .map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    format!("{{{}}}", params::FAMILY_RELATION),
                    vec![(params::ID_PERSONNE, IDENTITY_SENTINEL.to_string())],
                )
            })
            .collect()
    }
}

/// School subjects -> `{matiere}`.
pub struct SubjectMatcher;

impl Matcher for SubjectMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Subject
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        SUBJECT_RES
            .iter()
            .flat_map(|re| re.find_iter(text))
            .map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    format!("{{{}}}", params::MATIERE),
                    vec![(params::MATIERE, collapse(m.as_str()).to_lowercase())],
                )
            })
            .collect()
    }
}

/// Tests, quizzes, exams -> `{type_evaluation}`.
pub struct EvaluationMatcher;

impl Matcher for EvaluationMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::EvaluationType
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        EVALUATION_RES
            .iter()
            .flat_map(|re| re.find_iter(text))
            .map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    format!("{{{}}}", params::TYPE_EVALUATION),
                    vec![(params::TYPE_EVALUATION, normalize_evaluation_type(m.as_str()))],
                )
            })
            .collect()
    }
}

/// Term / trimester phrases -> `{codeperiexam}` with the fixed period code.
pub struct TermMatcher;

impl Matcher for TermMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Term
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        TERM_RES
            .iter()
            .flat_map(|(re, code)| re.find_iter(text).map(move |m| (m, *code)))
            .map(|(m, code)| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    format!("{{{}}}", params::CODE_PERI_EXAM),
                    vec![(params::CODE_PERI_EXAM, code.to_string())],
                )
            })
            .collect()
    }
}

/// Two consecutive all-uppercase words -> `{NomFr} {PrenomFr}`.
///
/// Every adjacent pair is reported so that a pair whose first word was taken
/// by a higher-priority matcher ("SVT DUPONT ALI") still yields "DUPONT ALI".
pub struct NamePairMatcher;

impl Matcher for NamePairMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::NamePair
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let tokens: Vec<_> = UPPER_TOKEN_RE.find_iter(text).collect();
        tokens
            .windows(2)
            .filter(|pair| {
                let gap = &text[pair[0].end()..pair[1].start()];
                !gap.is_empty() && gap.chars().all(char::is_whitespace)
            })
            .map(|pair| {
                Candidate::new(
                    pair[0].start(),
                    pair[1].end(),
                    self.kind(),
                    format!("{{{}}} {{{}}}", params::NOM_FR, params::PRENOM_FR),
                    vec![
                        (params::NOM_FR, pair[0].as_str().to_string()),
                        (params::PRENOM_FR, pair[1].as_str().to_string()),
                    ],
                )
            })
            .collect()
    }
}

/// Digit-letter-digit class codes ("7B2") -> `{CODECLASSEFR}`.
pub struct ClassCodeMatcher;

impl Matcher for ClassCodeMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::ClassCode
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        simple_candidates(&CLASS_CODE_RE, text, self.kind(), params::CODE_CLASSE)
    }
}

/// "2023/2024" or "2023-2024" -> `{AnneeScolaire}`.
pub struct SchoolYearMatcher;

impl Matcher for SchoolYearMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::SchoolYear
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        simple_candidates(&SCHOOL_YEAR_RE, text, self.kind(), params::ANNEE_SCOLAIRE)
    }
}

/// Weekday names and relative day words -> `{jour}`.
pub struct WeekdayMatcher;

impl Matcher for WeekdayMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::Weekday
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let placeholder = format!("{{{}}}", params::JOUR);

        let mut found: Vec<Candidate> = WEEKDAY_RE
            .find_iter(text)
            .map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    placeholder.clone(),
                    vec![(params::JOUR, capitalize(&m.as_str().to_lowercase()))],
                )
            })
            .collect();

        for (re, expression) in RELATIVE_DAY_RES.iter() {
            found.extend(re.find_iter(text).map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    placeholder.clone(),
                    vec![(params::JOUR, expression.to_string())],
                )
            }));
        }

        found
    }
}

/// Bare numbers of four or more digits that read as person identifiers.
pub struct PersonIdMatcher;

impl Matcher for PersonIdMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::PersonId
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        NUMBER_RE
            .find_iter(text)
            .filter(|m| classify_number(text, m.start(), m.end()) == NumberRole::Identifier)
            .map(|m| {
                Candidate::new(
                    m.start(),
                    m.end(),
                    self.kind(),
                    format!("{{{}}}", params::ID_PERSONNE_LITERAL),
                    vec![(params::ID_PERSONNE_LITERAL, m.as_str().to_string())],
                )
            })
            .collect()
    }
}

/// Quoted single-word uppercase values -> `'{NomFr}'` when the question talks
/// about a name, `'{Valeur}'` otherwise. The quotes stay in the template.
pub struct QuotedValueMatcher;

impl Matcher for QuotedValueMatcher {
    fn kind(&self) -> EntityKind {
        EntityKind::QuotedValue
    }

    fn candidates(&self, text: &str) -> Vec<Candidate> {
        let param = if NOM_WORD_RE.is_match(text) {
            params::NOM_FR
        } else {
            params::VALEUR
        };

        QUOTED_RE
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let (inner, quote) = match (caps.get(1), caps.get(2)) {
                    (Some(inner), _) => (inner.as_str(), '\''),
                    (None, Some(inner)) => (inner.as_str(), '"'),
                    _ => return None,
                };
                if !is_single_upper_word(inner) {
                    return None;
                }
                Some(Candidate::new(
                    whole.start(),
                    whole.end(),
                    self.kind(),
                    format!("{q}{{{p}}}{q}", q = quote, p = param),
                    vec![(param, inner.to_string())],
                ))
            })
            .collect()
    }
}

/// The full matcher chain in priority order.
pub fn default_matchers() -> Vec<Box<dyn Matcher>> {
    vec![
        Box::new(FamilyMatcher),
        Box::new(SubjectMatcher),
        Box::new(EvaluationMatcher),
        Box::new(TermMatcher),
        Box::new(NamePairMatcher),
        Box::new(ClassCodeMatcher),
        Box::new(SchoolYearMatcher),
        Box::new(WeekdayMatcher),
        Box::new(PersonIdMatcher),
        Box::new(QuotedValueMatcher),
    ]
}

fn simple_candidates(re: &Regex, text: &str, kind: EntityKind, param: &str) -> Vec<Candidate> {
    re.find_iter(text)
        .map(|m| {
            Candidate::new(
                m.start(),
                m.end(),
                kind,
                format!("{{{}}}", param),
                vec![(param, m.as_str().to_string())],
            )
        })
        .collect()
}

/// How a bare number should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberRole {
    Identifier,
    Label,
}

/// Decide whether the number at `start..end` is an identifier or a label.
///
/// Numbers shorter than four digits are always labels. Otherwise the nearest
/// context word decides: a label word ("chapitre", "exercice", ...) makes it a
/// label unless an identifier word ("élève", "matricule", ...) sits strictly
/// closer. With no context word at all, four digits are enough to be an id.
///
/// Distances are counted with every entity phrase ("mon fils", "1er
/// trimestre", "2023/2024") or placeholder as a single word, so a question
/// and its template classify the same number the same way.
pub fn classify_number(text: &str, start: usize, end: usize) -> NumberRole {
    if text[start..end].chars().count() < lexicon::MIN_ID_DIGITS {
        return NumberRole::Label;
    }

    let spans = entity_spans(text);
    // Part of a higher-priority entity such as a school year.
    if spans.iter().any(|&(s, e)| s < end && start < e) {
        return NumberRole::Label;
    }

    let mut tokens: Vec<(usize, Option<String>)> = Vec::new();
    for token in CONTEXT_TOKEN_RE.find_iter(text) {
        match spans
            .iter()
            .find(|&&(s, e)| s <= token.start() && token.start() < e)
        {
            Some(&(s, _)) => {
                if tokens.last().map(|(at, _)| *at) != Some(s) {
                    tokens.push((s, None));
                }
            }
            None => tokens.push((token.start(), Some(token.as_str().to_lowercase()))),
        }
    }

    let position = match tokens.iter().position(|(at, _)| *at == start) {
        Some(position) => position,
        None => return NumberRole::Identifier,
    };

    let lo = position.saturating_sub(lexicon::CONTEXT_WORDS + 1);
    let hi = (position + lexicon::CONTEXT_WORDS + 2).min(tokens.len());

    let mut nearest_label: Option<usize> = None;
    let mut nearest_id: Option<usize> = None;
    for (i, (_, word)) in tokens.iter().enumerate().take(hi).skip(lo) {
        let word = match word {
            Some(word) if i != position => word,
            _ => continue,
        };
        let distance = i.abs_diff(position) - 1;
        if lexicon::LABEL_CONTEXT.contains(&word.as_str()) {
            nearest_label = Some(nearest_label.map_or(distance, |d| d.min(distance)));
        } else if lexicon::ID_CONTEXT.contains(&word.as_str()) {
            nearest_id = Some(nearest_id.map_or(distance, |d| d.min(distance)));
        }
    }

    match (nearest_label, nearest_id) {
        (Some(label), Some(id)) if id < label => NumberRole::Identifier,
        (Some(_), _) => NumberRole::Label,
        _ => NumberRole::Identifier,
    }
}

/// Merged byte ranges of entity phrases and placeholders in `text`.
fn entity_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans: Vec<(usize, usize)> = ENTITY_SPAN_RES
        .iter()
        .flat_map(|re| re.find_iter(text))
        .map(|m| (m.start(), m.end()))
        .collect();
    spans.sort_unstable();

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for (start, end) in spans {
        match merged.last_mut() {
            Some(last) if start < last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

/// Map an evaluation phrase to its canonical type, keeping a trailing number.
pub fn normalize_evaluation_type(raw: &str) -> String {
    let collapsed = collapse(raw).to_lowercase();
    let (base, number) = match TRAILING_NUMBER_RE.captures(&collapsed) {
        Some(caps) if !caps[1].is_empty() => (caps[1].to_string(), Some(caps[2].to_string())),
        _ => (collapsed.clone(), None),
    };
    // Plural forms share the singular canonical type.
    let singular = base
        .split(' ')
        .map(|w| if w.len() > 3 { w.trim_end_matches('s') } else { w })
        .collect::<Vec<_>>()
        .join(" ");

    let canonical = canonical_evaluation(&base)
        .or_else(|| canonical_evaluation(&singular))
        .unwrap_or_else(|| base.clone());

    match number {
        Some(n) => format!("{} {}", canonical, n),
        None => canonical,
    }
}

fn canonical_evaluation(base: &str) -> Option<String> {
    if let Some((_, canonical)) = lexicon::EVALUATION_SYNONYMS.iter().find(|(k, _)| *k == base) {
        return Some(canonical.to_string());
    }

    // Longest synonym appearing as whole words inside the phrase.
    let words: Vec<&str> = base.split(' ').collect();
    let contained = lexicon::EVALUATION_SYNONYMS
        .iter()
        .filter(|(key, _)| {
            let key_words: Vec<&str> = key.split(' ').collect();
            words.windows(key_words.len()).any(|w| w == key_words.as_slice())
        })
        .max_by_key(|(key, _)| key.len());
    if let Some((_, canonical)) = contained {
        return Some(canonical.to_string());
    }

    lexicon::EVALUATION_SYNONYMS
        .iter()
        .map(|(key, canonical)| (jaro_winkler(key, base), canonical))
        .filter(|(score, _)| *score >= 0.92)
        .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, canonical)| canonical.to_string())
}

/// Python-style `isupper()` on a single word: at least one cased character and
/// no lowercase ones.
fn is_single_upper_word(value: &str) -> bool {
    let trimmed = value.trim();
    !trimmed.is_empty()
        && !trimmed.contains(char::is_whitespace)
        && trimmed.chars().any(char::is_uppercase)
        && !trimmed.chars().any(char::is_lowercase)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn collapse(text: &str) -> String {
    WHITESPACE_RE.replace_all(text.trim(), " ").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_of(text: &str, number: &str) -> NumberRole {
        let start = text.find(number).unwrap();
        classify_number(text, start, start + number.len())
    }

    #[test]
    fn test_label_context_wins() {
        assert_eq!(role_of("le chapitre 1204 du manuel", "1204"), NumberRole::Label);
        assert_eq!(role_of("exercice 2031 page 4", "2031"), NumberRole::Label);
    }

    #[test]
    fn test_identifier_context() {
        assert_eq!(role_of("notes de l'élève 12345", "12345"), NumberRole::Identifier);
        assert_eq!(role_of("absences pour 7012", "7012"), NumberRole::Identifier);
    }

    #[test]
    fn test_closer_identifier_word_wins() {
        assert_eq!(
            role_of("exercice de l'élève 45678", "45678"),
            NumberRole::Identifier
        );
        assert_eq!(role_of("élève du cours 45678", "45678"), NumberRole::Label);
    }

    #[test]
    fn test_far_label_word_is_ignored() {
        assert_eq!(
            role_of("chapitre lu par le fils 45678", "45678"),
            NumberRole::Identifier
        );
    }

    #[test]
    fn test_entity_phrase_counts_as_one_word() {
        // "mon fils" and its placeholder sit at the same distance.
        assert_eq!(
            role_of("élève mon fils 45678 a b chapitre", "45678"),
            NumberRole::Identifier
        );
        assert_eq!(
            role_of("élève {family_relation} 45678 a b chapitre", "45678"),
            NumberRole::Identifier
        );
        assert_eq!(
            role_of("chapitre du 1er trimestre 45678 a b élève", "45678"),
            role_of("chapitre du {codeperiexam} 45678 a b élève", "45678")
        );
    }

    #[test]
    fn test_year_digits_are_not_ids() {
        assert_eq!(role_of("notes 2023/2024", "2024"), NumberRole::Label);
    }

    #[test]
    fn test_evaluation_number_stops_before_a_year() {
        let found = EvaluationMatcher.candidates("notes du contrôle 2023/2024");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bindings[0].1, "contrôle");
        let found = EvaluationMatcher.candidates("notes du contrôle 2");
        assert_eq!(found[0].bindings[0].1, "contrôle 2");
    }

    #[test]
    fn test_short_numbers_are_labels() {
        assert_eq!(role_of("il a 2 absences", "2"), NumberRole::Label);
        assert_eq!(role_of("élève 123", "123"), NumberRole::Label);
    }

    #[test]
    fn test_no_inside_other_words_is_not_label() {
        // "nombre" and "{nomfr}" must not count as the "no" label word.
        assert_eq!(role_of("nombre de notes 45678", "45678"), NumberRole::Identifier);
    }

    #[test]
    fn test_normalize_evaluation_type() {
        assert_eq!(normalize_evaluation_type("devoir de controle"), "devoir de contrôle");
        assert_eq!(normalize_evaluation_type("Devoir de Contrôle 2"), "devoir de contrôle 2");
        assert_eq!(normalize_evaluation_type("DS"), "devoir surveillé");
        assert_eq!(normalize_evaluation_type("controle"), "contrôle");
        assert_eq!(normalize_evaluation_type("interro"), "interrogation");
        assert_eq!(normalize_evaluation_type("devoirs surveillés"), "devoir surveillé");
    }

    #[test]
    fn test_name_pair_skips_non_adjacent() {
        let found = NamePairMatcher.candidates("DUPONT, ALI");
        assert!(found.is_empty());
        let found = NamePairMatcher.candidates("notes de DUPONT ALI");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bindings[0], ("NomFr".to_string(), "DUPONT".to_string()));
    }

    #[test]
    fn test_quoted_value_param_choice() {
        let found = QuotedValueMatcher.candidates("élèves avec le nom 'BENALI'");
        assert_eq!(found[0].replacement, "'{NomFr}'");
        let found = QuotedValueMatcher.candidates("classe 'A'");
        assert_eq!(found[0].replacement, "'{Valeur}'");
        assert!(QuotedValueMatcher.candidates("classe 'Rouge'").is_empty());
    }

    #[test]
    fn test_relative_days_map_to_expressions() {
        let found = WeekdayMatcher.candidates("emploi du temps de demain");
        assert_eq!(
            found[0].bindings[0].1,
            "DATE_ADD(CURRENT_DATE, INTERVAL 1 DAY)"
        );
        let found = WeekdayMatcher.candidates("cours du MERCREDI");
        assert_eq!(found[0].bindings[0].1, "Mercredi");
    }
}
