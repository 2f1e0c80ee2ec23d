//! Vocabulary and placeholder names for the school domain.

/// Placeholder names. These strings end up in stored templates, so renaming
/// any of them invalidates existing cache files.
pub mod params {
    pub const FAMILY_RELATION: &str = "family_relation";
    pub const ID_PERSONNE: &str = "id_personne";
    pub const MATIERE: &str = "matiere";
    pub const TYPE_EVALUATION: &str = "type_evaluation";
    pub const CODE_PERI_EXAM: &str = "codeperiexam";
    pub const NOM_FR: &str = "NomFr";
    pub const PRENOM_FR: &str = "PrenomFr";
    pub const CODE_CLASSE: &str = "CODECLASSEFR";
    pub const ANNEE_SCOLAIRE: &str = "AnneeScolaire";
    pub const JOUR: &str = "jour";
    pub const ID_PERSONNE_LITERAL: &str = "IDPersonne";
    pub const VALEUR: &str = "Valeur";
}

/// Value stored under `id_personne` when a family reference is found. It is a
/// marker, not an identifier: the real ids come from the caller at rehydration.
pub const IDENTITY_SENTINEL: &str = "id_personne";

/// "mon fils", "ma fille", "mes enfants" and the misspellings seen in logs.
pub const FAMILY_PATTERN: &str =
    r"(?i)\b(?:mon|ma|mes)\s+(?:enfants?|enfnt|filles?|fill|file|fils|fil|garçons?|garcons?)\b";

/// One pattern per subject; the matched text (lowercased) is the value.
pub const SUBJECT_PATTERNS: &[&str] = &[
    r"(?i)\b(?:mathématiques?|mathematiques?|maths?)\b",
    r"(?i)\b(?:français|francais)\b",
    r"(?i)\banglais\b",
    r"(?i)\bespagnol\b",
    r"(?i)\ballemand\b",
    r"(?i)\bitalien\b",
    r"(?i)\b(?:histoire|hist)\b",
    r"(?i)\b(?:géographie|geographie|géo|geo)\b",
    r"(?i)\bsciences?\b",
    r"(?i)\b(?:physique|pysique)\b",
    r"(?i)\bchimie\b",
    r"(?i)\b(?:biologie|bio)\b",
    r"(?i)\bsvt\b",
    r"(?i)\b(?:eps|sport)\b",
    r"(?i)\b(?:technologie|techno)\b",
    r"(?i)\b(?:informatique|info)\b",
    r"(?i)\b(?:philosophie|philo)\b",
    r"(?i)\barts?\s+plastiques?\b",
    r"(?i)\bmusique\b",
    r"(?i)\béducation\s+musicale\b",
    r"(?i)\b(?:économie|economie)\b",
];

/// Evaluation vocabulary. A trailing number of one or two digits ("contrôle 2")
/// belongs to the match; longer numbers are years or ids.
pub const EVALUATION_PATTERNS: &[&str] = &[
    r"(?i)\bdevoirs?\s+(?:de\s+|du\s+)?contr[oô]les?(?:\s*\d{1,2})?\b",
    r"(?i)\bdevoirs?\s+surveill[ée]s?(?:\s*\d{1,2})?\b",
    r"(?i)\bdevoirs?\s+maison(?:\s*\d{1,2})?\b",
    r"(?i)\bcontr[oô]les?(?:\s*\d{1,2})?\b",
    r"(?i)\bds(?:\s*\d{1,2})?\b",
    r"(?i)\bdc(?:\s*\d{1,2})?\b",
    r"(?i)\bdm(?:\s*\d{1,2})?\b",
    r"(?i)\bexamens?(?:\s*\d{1,2})?\b",
    r"(?i)\bbac\s+blanc\b",
    r"(?i)\bbrevet\s+blanc\b",
    r"(?i)\bcompositions?(?:\s*\d{1,2})?\b",
    r"(?i)\b[ée]valuations?(?:\s*\d{1,2})?\b",
    r"(?i)\binterrogations?(?:\s*\d{1,2})?\b",
    r"(?i)\binterros?(?:\s*\d{1,2})?\b",
    r"(?i)\btests?(?:\s*\d{1,2})?\b",
    r"(?i)\bquiz(?:\s*\d{1,2})?\b",
];

/// Variant -> canonical evaluation type.
pub const EVALUATION_SYNONYMS: &[(&str, &str)] = &[
    ("controle", "contrôle"),
    ("contrôle", "contrôle"),
    ("devoir de controle", "devoir de contrôle"),
    ("devoir de contrôle", "devoir de contrôle"),
    ("devoir du controle", "devoir de contrôle"),
    ("devoir du contrôle", "devoir de contrôle"),
    ("devoir controle", "devoir de contrôle"),
    ("devoir contrôle", "devoir de contrôle"),
    ("dc", "devoir de contrôle"),
    ("devoir surveille", "devoir surveillé"),
    ("devoir surveillé", "devoir surveillé"),
    ("ds", "devoir surveillé"),
    ("devoir maison", "devoir maison"),
    ("dm", "devoir maison"),
    ("interrogation", "interrogation"),
    ("interro", "interrogation"),
    ("evaluation", "évaluation"),
    ("évaluation", "évaluation"),
    ("test", "test"),
    ("quiz", "quiz"),
    ("examen", "examen"),
    ("bac blanc", "bac blanc"),
    ("brevet blanc", "brevet blanc"),
    ("composition", "composition"),
];

/// Term phrases and the exam-period code each maps to. These codes are the
/// `codeperiexam` values of the school database and must not change.
pub const TERM_PATTERNS: &[(&str, &str)] = &[
    (r"(?i)\b(?:1er|1ère|1ere|1re|premier|première|premiere)\s+trimestre\b", "31"),
    (r"(?i)\b(?:2ème|2eme|2éme|2e|deuxième|deuxieme|second|seconde)\s+trimestre\b", "32"),
    (r"(?i)\b(?:3ème|3eme|3éme|3e|troisième|troisieme)\s+trimestre\b", "33"),
    (r"(?i)\btrimestre\s*1\b", "31"),
    (r"(?i)\btrimestre\s*2\b", "32"),
    (r"(?i)\btrimestre\s*3\b", "33"),
];

pub const WEEKDAYS: &[&str] = &[
    "lundi", "mardi", "mercredi", "jeudi", "vendredi", "samedi", "dimanche",
];

/// Relative day words resolve to SQL date expressions, never to literals.
pub const RELATIVE_DAYS: &[(&str, &str)] = &[
    (r"(?i)\baujourd['’]?hui\b", "CURRENT_DATE"),
    (r"(?i)\bdemain\b", "DATE_ADD(CURRENT_DATE, INTERVAL 1 DAY)"),
    (r"(?i)\bhier\b", "DATE_SUB(CURRENT_DATE, INTERVAL 1 DAY)"),
];

/// Words that make a nearby number a label ("chapitre 1204").
pub const LABEL_CONTEXT: &[&str] = &[
    "chapitre", "leçon", "lecon", "cours", "exercice", "activité", "activite", "séance", "seance",
    "session", "partie", "niveau", "étape", "etape", "numéro", "numero", "n°", "no", "#", "page",
];

/// Words that make a nearby number a person identifier ("élève 12345").
pub const ID_CONTEXT: &[&str] = &[
    "élève", "eleve", "étudiant", "etudiant", "id", "identifiant", "matricule",
];

/// Words inspected on each side of a bare number. Only words strictly
/// between the context word and the number are counted, and an entity
/// phrase or placeholder counts as one word.
pub const CONTEXT_WORDS: usize = 3;

/// Shortest bare number that may be tagged as an identifier.
pub const MIN_ID_DIGITS: usize = 4;
