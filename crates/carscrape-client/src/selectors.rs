use std::collections::HashMap;

use scraper::Selector;

/// CSS selector lists used to find vehicle links and fields.
///
/// Each field holds its selectors in priority order; the first one that
/// matches something non-empty wins.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectorSet {
    pub car_links: Vec<String>,
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub year: Vec<String>,
    pub images: Vec<String>,
    pub optionals: Vec<String>,
    pub dealer: Vec<String>,
    /// Field-specific selectors for specs usually rendered next to an icon.
    pub specs: HashMap<String, Vec<String>>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for SelectorSet {
    fn default() -> Self {
        let specs = [
            (
                "mileage",
                &[".icon-km + span", ".kilometragem-valor", "[data-icon=\"km\"] + span"][..],
            ),
            (
                "fuel",
                &[".icon-fuel + span", ".combustivel-tipo", "[data-icon=\"fuel\"] + span"][..],
            ),
            (
                "transmission",
                &[
                    ".icon-gear + span",
                    ".cambio-tipo",
                    "[data-icon=\"transmission\"] + span",
                ][..],
            ),
            (
                "color",
                &[".icon-color + span", ".cor-veiculo", "[data-icon=\"color\"] + span"][..],
            ),
            (
                "plate",
                &[".icon-plate + span", ".placa-veiculo", "[data-icon=\"plate\"] + span"][..],
            ),
            (
                "doors",
                &[".icon-doors + span", ".numero-portas", "[data-icon=\"doors\"] + span"][..],
            ),
        ]
        .into_iter()
        .map(|(field, list)| (field.to_string(), owned(list)))
        .collect();

        Self {
            car_links: owned(&[
                "a[href*=\"/anuncio/\"]",
                "a[href*=\"/veiculo/\"]",
                "a[href*=\"/carro/\"]",
                "a[href*=\"/automovel/\"]",
                "a[href*=\"/vehicle/\"]",
                ".item-carro a",
                ".veiculo-item a",
                ".car-item a",
                ".anuncio-item a",
                ".vehicle-card a",
                ".card-veiculo a",
            ]),
            title: owned(&[
                "h1.titulo-veiculo",
                "h1.car-title",
                ".vehicle-title h1",
                ".anuncio-titulo h1",
                "h1",
                ".titulo",
                ".title",
                ".nome-veiculo",
                ".car-title",
                ".vehicle-title",
                ".anuncio-titulo",
            ]),
            price: owned(&[
                ".preco-valor",
                ".valor-venda",
                ".price-container .valor",
                ".price-display",
                ".preco",
                ".price",
                ".valor",
                "[class*=\"prec\"]",
                "[class*=\"valor\"]",
                "[class*=\"price\"]",
                ".car-price",
                ".veiculo-preco",
                ".preco-venda",
            ]),
            year: owned(&[".ano-modelo", ".badge-ano", ".year-badge"]),
            images: owned(&[
                ".gallery-container img",
                ".carousel-images img",
                ".vehicle-photos img",
                ".galeria-fotos img",
                ".thumbs-container img",
                ".galeria img",
                ".fotos img",
                ".gallery img",
                ".car-images img",
                ".carousel img",
                ".slider img",
                ".thumbs img",
                "img[alt*=\"carro\"]",
                "img[alt*=\"veículo\"]",
            ]),
            optionals: owned(&[
                ".opcionais-lista",
                ".optional-items",
                ".vehicle-features",
                ".features-list",
                ".opcionais",
                ".optional",
                ".features",
                ".equipamentos",
                ".acessorios",
                ".extras",
            ]),
            dealer: owned(&[".dealer-name", ".vendedor-nome", ".loja-nome"]),
            specs,
        }
    }
}

impl SelectorSet {
    /// Append caller-supplied selectors to the defaults.
    ///
    /// Known keys (`car_links`, `title`, `price`, `year`, `images`,
    /// `optionals`, `dealer`) extend their list; any other key is treated as
    /// a spec field.
    pub fn merged_with(mut self, custom: &HashMap<String, Vec<String>>) -> Self {
        for (key, extra) in custom {
            let list = match key.as_str() {
                "car_links" => &mut self.car_links,
                "title" => &mut self.title,
                "price" => &mut self.price,
                "year" => &mut self.year,
                "images" => &mut self.images,
                "optionals" => &mut self.optionals,
                "dealer" => &mut self.dealer,
                other => self.specs.entry(other.to_string()).or_default(),
            };
            list.extend(extra.iter().cloned());
        }
        self
    }
}

/// Parse a selector list, skipping (and logging) invalid entries.
pub(crate) fn compile(list: &[String]) -> Vec<Selector> {
    list.iter()
        .filter_map(|raw| match Selector::parse(raw) {
            Ok(selector) => Some(selector),
            Err(e) => {
                tracing::warn!(selector = %raw, error = %e, "Skipping invalid CSS selector");
                None
            }
        })
        .collect()
}
