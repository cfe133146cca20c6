//! HTML extraction for vehicle listing sites.
//!
//! Two passes, both pure functions over an HTML string:
//! - [`discover_links`] finds vehicle detail pages on a listing page.
//! - [`extract_vehicle`] turns one detail page into a [`VehicleRecord`].
//!
//! Field lookup tries the CSS selectors from a [`SelectorSet`] first and
//! falls back to pattern matching over the page's visible text, which is
//! what keeps unknown sites partially working.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::selectors::{SelectorSet, compile};

/// Path fragments that mark a link as a vehicle detail page.
const VEHICLE_KEYWORDS: &[&str] = &["veiculo", "carro", "anuncio", "automovel", "vehicle"];

const FUEL_VALUES: &[&str] = &["flex", "gasolina", "etanol", "diesel", "gnv", "elétrico", "híbrido"];
const TRANSMISSION_VALUES: &[&str] = &["automático", "automatizado", "manual", "cvt"];
const COLOR_VALUES: &[&str] = &[
    "preta", "preto", "branca", "branco", "prata", "vermelha", "vermelho", "azul", "cinza",
];
const COMMON_OPTIONALS: &[&str] = &[
    "air bag",
    "abs",
    "direção hidráulica",
    "ar condicionado",
    "vidros elétricos",
    "travas elétricas",
    "alarme",
    "som",
    "cd player",
    "mp3",
    "bluetooth",
    "gps",
    "câmera de ré",
    "sensor de estacionamento",
    "teto solar",
    "banco de couro",
];
const MAX_OPTIONALS: usize = 20;
const IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp"];
const IMAGE_NOISE: &[&str] = &["logo", "icon", "btn"];

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"R\$\s*[\d.,]+").expect("price regex"));
static MILEAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)([\d.,]+)\s*km\b").expect("mileage regex"));
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:19|20)\d{2}/(?:19|20)\d{2}\b|\b(?:19|20)\d{2}\b").expect("year regex")
});
static DOORS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d)\s*portas?\b").expect("doors regex"));
static PLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:[A-Z]{3}-?\d{4}|[A-Z]{3}\d[A-Z]\d{2})\b").expect("plate regex")
});
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?\d{2}\)?\s*\d{4,5}-?\d{4}").expect("phone regex"));
static WHATSAPP_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{11,}").expect("whatsapp regex"));
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Which optional sections of a record to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    pub extract_images: bool,
    pub extract_optionals: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            extract_images: true,
            extract_optionals: true,
        }
    }
}

/// One vehicle advert. Missing fields are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<String>,
    pub fuel: Option<String>,
    pub transmission: Option<String>,
    pub color: Option<String>,
    pub plate: Option<String>,
    pub doors: Option<String>,
    pub dealer: Option<String>,
    pub images: Vec<String>,
    pub total_images: usize,
    pub optionals: Vec<String>,
    pub total_optionals: usize,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

/// Collapse runs of whitespace and trim.
fn clean_text(raw: &str) -> String {
    WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned()
}

fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// Text of the first element matched by any selector, in priority order.
fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .map(element_text)
            .find(|text| !text.is_empty())
    })
}

fn body_text(document: &Html) -> String {
    let body = Selector::parse("body").ok();
    let text = body
        .and_then(|selector| document.select(&selector).next())
        .map(element_text);
    text.unwrap_or_else(|| element_text(document.root_element()))
}

fn first_value(haystack_lower: &str, values: &[&str]) -> Option<String> {
    values
        .iter()
        .find(|v| haystack_lower.contains(*v))
        .map(|v| v.to_string())
}

fn is_vehicle_link(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    VEHICLE_KEYWORDS.iter().any(|k| path.contains(k))
}

/// Vehicle detail links on a listing page, deduplicated, at most `limit`.
pub fn discover_links(
    html: &str,
    base_url: &Url,
    selectors: &SelectorSet,
    limit: usize,
) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for selector in compile(&selectors.car_links) {
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Ok(resolved) = base_url.join(href.trim()) else {
                continue;
            };
            if !matches!(resolved.scheme(), "http" | "https") || !is_vehicle_link(&resolved) {
                continue;
            }
            let mut resolved = resolved;
            resolved.set_fragment(None);
            let link = resolved.to_string();
            if seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }

    tracing::debug!(found = links.len(), limit, url = %base_url, "Discovered vehicle links");
    links.truncate(limit);
    links
}

/// Extract one vehicle record from a detail page.
pub fn extract_vehicle(
    html: &str,
    page_url: &Url,
    selectors: &SelectorSet,
    options: ExtractOptions,
) -> VehicleRecord {
    let document = Html::parse_document(html);
    let text = body_text(&document);
    let lower = text.to_lowercase();

    let title = first_text(&document, &compile(&selectors.title)).or_else(|| {
        Selector::parse("title")
            .ok()
            .and_then(|s| document.select(&s).next().map(element_text))
            .filter(|t| !t.is_empty())
    });
    let (brand, model) = brand_and_model(title.as_deref());

    let spec = |field: &str| -> Option<String> {
        selectors
            .specs
            .get(field)
            .and_then(|list| first_text(&document, &compile(list)))
    };

    let year = first_text(&document, &compile(&selectors.year))
        .or_else(|| YEAR_RE.find(&text).map(|m| m.as_str().to_string()));
    let mileage = spec("mileage").or_else(|| MILEAGE_RE.find(&text).map(|m| m.as_str().to_string()));
    let fuel = spec("fuel").or_else(|| first_value(&lower, FUEL_VALUES));
    let transmission = spec("transmission").or_else(|| first_value(&lower, TRANSMISSION_VALUES));
    let color = spec("color").or_else(|| first_value(&lower, COLOR_VALUES));
    let plate = spec("plate").or_else(|| {
        PLATE_RE
            .find(&text)
            .map(|m| m.as_str().to_uppercase())
    });
    let doors = spec("doors").or_else(|| DOORS_RE.find(&text).map(|m| m.as_str().to_string()));

    let images = if options.extract_images {
        collect_images(&document, page_url, &compile(&selectors.images))
    } else {
        Vec::new()
    };
    let optionals = if options.extract_optionals {
        collect_optionals(&document, &compile(&selectors.optionals), &lower)
    } else {
        Vec::new()
    };

    VehicleRecord {
        url: page_url.to_string(),
        domain: page_url.host_str().unwrap_or_default().to_string(),
        price: find_price(&document, &compile(&selectors.price), &text),
        title,
        brand,
        model,
        year,
        mileage,
        fuel,
        transmission,
        color,
        plate,
        doors,
        dealer: first_text(&document, &compile(&selectors.dealer)),
        total_images: images.len(),
        images,
        total_optionals: optionals.len(),
        optionals,
        phone: PHONE_RE.find(&text).map(|m| m.as_str().to_string()),
        whatsapp: find_whatsapp(&document),
        extracted_at: Utc::now(),
    }
}

/// First word of the title is the brand, the next two the model.
fn brand_and_model(title: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(title) = title else {
        return (None, None);
    };
    let words: Vec<String> = title.split_whitespace().map(str::to_uppercase).collect();
    if words.len() < 2 {
        return (None, None);
    }
    let model_end = words.len().min(3);
    (Some(words[0].clone()), Some(words[1..model_end].join(" ")))
}

/// A currency-looking price element, else the largest `R$` amount in the text.
fn find_price(document: &Html, selectors: &[Selector], text: &str) -> Option<String> {
    let from_elements = selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .map(element_text)
            .find(|t| t.contains("R$") || t.contains('$'))
    });
    from_elements.or_else(|| {
        PRICE_RE
            .find_iter(text)
            .map(|m| m.as_str())
            .max_by_key(|candidate| {
                candidate
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect::<String>()
                    .parse::<u64>()
                    .unwrap_or(0)
            })
            .map(str::to_string)
    })
}

fn collect_images(document: &Html, page_url: &Url, selectors: &[Selector]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();

    for selector in selectors {
        for img in document.select(selector) {
            let attrs = img.value();
            let Some(src) = attrs
                .attr("src")
                .or_else(|| attrs.attr("data-src"))
                .or_else(|| attrs.attr("data-lazy"))
            else {
                continue;
            };
            let Ok(resolved) = page_url.join(src.trim()) else {
                continue;
            };
            let candidate = resolved.to_string();
            let lower = candidate.to_lowercase();
            let looks_like_photo = IMAGE_EXTENSIONS.iter().any(|ext| lower.contains(ext))
                && !IMAGE_NOISE.iter().any(|noise| lower.contains(noise))
                && candidate.len() > 20;
            if looks_like_photo && seen.insert(candidate.clone()) {
                images.push(candidate);
            }
        }
    }
    images
}

fn collect_optionals(document: &Html, sections: &[Selector], body_lower: &str) -> Vec<String> {
    let mut optionals: Vec<String> = Vec::new();

    if let Ok(items) = Selector::parse("li, .item, span, p") {
        for section in sections {
            let Some(container) = document.select(section).next() else {
                continue;
            };
            for item in container.select(&items) {
                let text = element_text(item);
                let len = text.chars().count();
                if len > 2 && len < 50 && !optionals.contains(&text) {
                    optionals.push(text);
                }
            }
        }
    }

    if optionals.is_empty() {
        optionals = COMMON_OPTIONALS
            .iter()
            .filter(|o| body_lower.contains(*o))
            .map(|o| o.to_string())
            .collect();
    }

    optionals.truncate(MAX_OPTIONALS);
    optionals
}

fn find_whatsapp(document: &Html) -> Option<String> {
    let selector = Selector::parse(r#"a[href*="whatsapp"], a[href*="wa.me"]"#).ok()?;
    let href = document.select(&selector).next()?.value().attr("href")?;
    WHATSAPP_DIGITS_RE
        .find(href)
        .map(|m| m.as_str().to_string())
}
