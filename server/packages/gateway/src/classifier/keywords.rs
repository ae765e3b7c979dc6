//! Curated complexity phrases per language.
//!
//! Text is lowercased and split into alphanumeric words. A phrase matches
//! when its words appear contiguously. A separable verb matches when one of
//! its finite forms opens a clause whose last word is the particle, which is
//! where German main clauses put it ("Finde bitte heraus, ...").

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    German,
    French,
    Spanish,
}

impl Language {
    pub fn code(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::German => "de",
            Self::French => "fr",
            Self::Spanish => "es",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordMatch {
    pub language: Language,
    pub phrase: String,
}

impl fmt::Display for KeywordMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.language.code(), self.phrase)
    }
}

struct SeparableVerb {
    forms: &'static [&'static str],
    particle: &'static str,
}

const ENGLISH: &[&str] = &[
    "search the web",
    "search online",
    "look up",
    "browse to",
    "latest news",
    "current price",
    "stock price",
    "deep research",
    "research report",
    "generate an image",
    "generate a picture",
    "create an image",
    "draw a picture",
    "make a chart",
    "plot a graph",
    "create a chart",
    "visualize the data",
    "run this code",
    "run the code",
    "execute this",
    "python script",
    "analyze this file",
    "analyse this file",
    "parse this csv",
    "spreadsheet",
    "download the",
    "scrape",
    "build a website",
    "build an app",
    "generate a video",
    "generate audio",
    "text to speech",
    "compose a song",
];

const GERMAN: &[&str] = &[
    "suche im internet",
    "such im internet",
    "im web suchen",
    "recherchiere",
    "recherchieren",
    "aktuelle nachrichten",
    "aktueller preis",
    "erstelle ein bild",
    "generiere ein bild",
    "zeichne ein bild",
    "erstelle ein diagramm",
    "diagramm",
    "analysiere die datei",
    "tabelle erstellen",
    "herausfinden",
    "nachschlagen",
    "herunterladen",
    "ausführen",
    "darstellen",
    "nachsehen",
    "erstelle ein video",
    "vorlesen",
];

const GERMAN_SEPARABLE: &[SeparableVerb] = &[
    SeparableVerb {
        forms: &["finde", "find", "findest", "findet"],
        particle: "heraus",
    },
    SeparableVerb {
        forms: &["schlag", "schlage", "schlägst", "schlagt"],
        particle: "nach",
    },
    SeparableVerb {
        forms: &["lade", "lad", "lädst", "ladet"],
        particle: "herunter",
    },
    SeparableVerb {
        forms: &["führe", "führ", "führst", "führt"],
        particle: "aus",
    },
    SeparableVerb {
        forms: &["stelle", "stell", "stellst", "stellt"],
        particle: "dar",
    },
    SeparableVerb {
        forms: &["sieh", "siehst", "schau", "schaue"],
        particle: "nach",
    },
    SeparableVerb {
        forms: &["lies", "lest"],
        particle: "vor",
    },
];

const FRENCH: &[&str] = &[
    "recherche sur internet",
    "cherche sur le web",
    "cherche sur internet",
    "dernières nouvelles",
    "prix actuel",
    "génère une image",
    "crée une image",
    "dessine",
    "fais un graphique",
    "crée un graphique",
    "exécute le code",
    "exécute ce code",
    "analyse ce fichier",
    "télécharge",
    "recherche approfondie",
    "génère une vidéo",
];

const SPANISH: &[&str] = &[
    "busca en internet",
    "busca en la web",
    "últimas noticias",
    "precio actual",
    "genera una imagen",
    "crea una imagen",
    "dibuja",
    "haz un gráfico",
    "crea un gráfico",
    "ejecuta el código",
    "ejecuta este código",
    "analiza este archivo",
    "descarga",
    "investiga a fondo",
    "investigación profunda",
    "genera un video",
];

fn phrase_sets() -> [(Language, &'static [&'static str]); 4] {
    [
        (Language::English, ENGLISH),
        (Language::German, GERMAN),
        (Language::French, FRENCH),
        (Language::Spanish, SPANISH),
    ]
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

fn clauses(text: &str) -> Vec<Vec<String>> {
    text.split(|c: char| matches!(c, '.' | '!' | '?' | ';' | ':' | ',' | '\n'))
        .map(words)
        .filter(|clause| !clause.is_empty())
        .collect()
}

fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    !phrase.is_empty()
        && haystack.len() >= phrase.len()
        && haystack.windows(phrase.len()).any(|window| window == phrase)
}

fn separable_match(clause: &[String], verb: &SeparableVerb) -> bool {
    let Some((last, rest)) = clause.split_last() else {
        return false;
    };
    last == verb.particle && rest.iter().any(|word| verb.forms.contains(&word.as_str()))
}

/// Every phrase found in `text`, in table order.
pub fn scan(text: &str) -> Vec<KeywordMatch> {
    let tokens = words(text);
    let mut matches = Vec::new();
    if tokens.is_empty() {
        return matches;
    }

    for (language, phrases) in phrase_sets() {
        for phrase in phrases {
            if contains_phrase(&tokens, &words(phrase)) {
                matches.push(KeywordMatch {
                    language,
                    phrase: (*phrase).to_string(),
                });
            }
        }
    }

    let clauses = clauses(text);
    for verb in GERMAN_SEPARABLE {
        if clauses.iter().any(|clause| separable_match(clause, verb)) {
            matches.push(KeywordMatch {
                language: Language::German,
                phrase: format!("{}…{}", verb.forms[0], verb.particle),
            });
        }
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(text: &str) -> Vec<String> {
        scan(text).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn phrases_match_on_word_boundaries() {
        assert_eq!(evidence("Please search the web for flights"), vec!["en:search the web"]);
        assert!(evidence("I love a good scraper").is_empty());
        assert!(evidence("hello").is_empty());
    }

    #[test]
    fn matches_other_languages() {
        assert_eq!(evidence("Génère une image d'un chat"), vec!["fr:génère une image"]);
        assert_eq!(evidence("¿Puedes buscar? Busca en internet"), vec!["es:busca en internet"]);
        assert_eq!(evidence("Kannst du das herausfinden?"), vec!["de:herausfinden"]);
    }

    #[test]
    fn separable_verbs_split_across_the_clause() {
        assert_eq!(
            evidence("Finde bitte für mich heraus, wie das Wetter morgen wird."),
            vec!["de:finde…heraus"]
        );
        assert_eq!(
            evidence("Führe das Skript in der Sandbox aus"),
            vec!["de:führe…aus"]
        );
    }

    #[test]
    fn separable_particle_must_close_the_clause() {
        assert!(evidence("Ich führe ein Leben aus Liebe zur Musik").is_empty());
        assert!(evidence("Ich komme aus Berlin").is_empty());
    }
}
