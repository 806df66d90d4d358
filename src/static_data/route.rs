use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use ahash::AHashMap;
use serde::{Deserialize, Serialize, Serializer};

use super::{csv_reader, non_blank, parse_url, warn_unknown_columns, AgencyRegistry};
use crate::error::{Error, Result};

const FILE: &str = "routes.txt";

const COLUMNS: [&str; 10] = [
    "route_id",
    "agency_id",
    "route_short_name",
    "route_long_name",
    "route_desc",
    "route_type",
    "route_url",
    "route_color",
    "route_text_color",
    "route_sort_order",
];

const DEFAULT_COLOR: u32 = 0xFFFFFF;
const DEFAULT_TEXT_COLOR: u32 = 0x000000;

/// GTFS `route_type`. Values outside the table are kept as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteType {
    Tram,
    Subway,
    Rail,
    Bus,
    Ferry,
    CableTram,
    AerialLift,
    Funicular,
    Trolleybus,
    Monorail,
    Other(i32),
}

impl RouteType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Self::Tram,
            1 => Self::Subway,
            2 => Self::Rail,
            3 => Self::Bus,
            4 => Self::Ferry,
            5 => Self::CableTram,
            6 => Self::AerialLift,
            7 => Self::Funicular,
            11 => Self::Trolleybus,
            12 => Self::Monorail,
            other => Self::Other(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Self::Tram => 0,
            Self::Subway => 1,
            Self::Rail => 2,
            Self::Bus => 3,
            Self::Ferry => 4,
            Self::CableTram => 5,
            Self::AerialLift => 6,
            Self::Funicular => 7,
            Self::Trolleybus => 11,
            Self::Monorail => 12,
            Self::Other(other) => other,
        }
    }
}

impl Serialize for RouteType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(self.as_i32())
    }
}

#[derive(Deserialize, Debug, Default)]
struct RouteRow {
    route_id: Option<String>,
    agency_id: Option<String>,
    route_short_name: Option<String>,
    route_long_name: Option<String>,
    route_desc: Option<String>,
    route_type: Option<String>,
    route_url: Option<String>,
    route_color: Option<String>,
    route_text_color: Option<String>,
    route_sort_order: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub agency_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(rename = "type")]
    pub route_type: RouteType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// `RRGGBB`, absent when the file left it at the GTFS default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub sort_order: u32,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

/// Parses a `RRGGBB` colour. Returns `None` for blanks and for `default`.
fn parse_color(line: u64, column: &str, value: Option<String>, default: u32) -> Result<Option<String>> {
    let Some(value) = non_blank(value) else {
        return Ok(None);
    };

    let invalid = || Error::static_data(FILE, line, format!("{column} is not valid"));

    // from_str_radix accepts a sign, GTFS colours never carry one.
    if value.len() != 6 || value.starts_with('+') {
        return Err(invalid());
    }
    let rgb = u32::from_str_radix(&value, 16).map_err(|_| invalid())?;

    if rgb == default {
        Ok(None)
    } else {
        Ok(Some(format!("{rgb:06X}")))
    }
}

impl Route {
    fn from_row(row: RouteRow, line: u64, agencies: &AgencyRegistry) -> Result<Self> {
        let id = non_blank(row.route_id)
            .ok_or_else(|| Error::static_data(FILE, line, "route_id must not be blank"))?;

        let agency_id = match non_blank(row.agency_id) {
            Some(agency_id) => agency_id,
            None if agencies.len() < 2 => agencies.default_agency().id.clone(),
            None => return Err(Error::static_data(FILE, line, "agency_id must not be blank")),
        };
        if agencies.get(&agency_id).is_none() {
            return Err(Error::static_data(
                FILE,
                line,
                "agency_id must reference known agency",
            ));
        }

        let short_name = non_blank(row.route_short_name);
        let long_name = non_blank(row.route_long_name);
        if short_name.is_none() && long_name.is_none() {
            return Err(Error::static_data(
                FILE,
                line,
                "route_short_name and route_long_name must not both be blank",
            ));
        }

        let route_type = non_blank(row.route_type)
            .ok_or_else(|| Error::static_data(FILE, line, "route_type must not be blank"))?
            .parse::<i32>()
            .map(RouteType::from_i32)
            .map_err(|e| Error::static_data(FILE, line, format!("route_type: {e}")))?;

        let sort_order = match non_blank(row.route_sort_order) {
            Some(value) => value
                .parse::<u32>()
                .map_err(|e| Error::static_data(FILE, line, format!("route_sort_order: {e}")))?,
            None => 0,
        };

        Ok(Self {
            id,
            agency_id,
            short_name,
            long_name,
            desc: non_blank(row.route_desc),
            route_type,
            url: parse_url(FILE, line, "route_url", row.route_url)?,
            color: parse_color(line, "route_color", row.route_color, DEFAULT_COLOR)?,
            text_color: parse_color(
                line,
                "route_text_color",
                row.route_text_color,
                DEFAULT_TEXT_COLOR,
            )?,
            sort_order,
        })
    }
}

/// Routes keyed by `route_id`, each tied to a known agency.
#[derive(Debug, Clone)]
pub struct RouteRegistry {
    routes: AHashMap<String, Route>,
}

impl RouteRegistry {
    pub fn from_path(agencies: &AgencyRegistry, path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(agencies, BufReader::new(file))
    }

    pub fn from_reader<R: Read>(agencies: &AgencyRegistry, reader: R) -> Result<Self> {
        let mut reader = csv_reader(reader);
        warn_unknown_columns(FILE, reader.headers()?, &COLUMNS);

        let mut routes = AHashMap::new();

        for (index, row) in reader.deserialize::<RouteRow>().enumerate() {
            let line = index as u64 + 2;
            let route = Route::from_row(row?, line, agencies)?;

            if routes.contains_key(&route.id) {
                return Err(Error::static_data(FILE, line, "route_id must be unique"));
            }
            routes.insert(route.id.clone(), route);
        }

        if routes.is_empty() {
            return Err(Error::static_data(FILE, 1, "must specify at least one route"));
        }

        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Route> {
        self.routes.get(id)
    }

    /// Routes ordered by `route_sort_order`, then id.
    pub fn all(&self) -> Vec<&Route> {
        let mut routes: Vec<&Route> = self.routes.values().collect();
        routes.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.id.cmp(&b.id)));
        routes
    }

    pub fn for_agency<'a>(&'a self, agency_id: &'a str) -> impl Iterator<Item = &'a Route> + 'a {
        self.all()
            .into_iter()
            .filter(move |route| route.agency_id == agency_id)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_agency() -> AgencyRegistry {
        AgencyRegistry::from_reader(
            "agency_id,agency_name,agency_url,agency_timezone\nCM,Capital Metro,https://www.capmetro.org,America/Chicago\n"
                .as_bytes(),
        )
        .unwrap()
    }

    fn two_agencies() -> AgencyRegistry {
        AgencyRegistry::from_reader(
            "agency_id,agency_name,agency_url,agency_timezone\n\
CM,Capital Metro,https://www.capmetro.org,America/Chicago\n\
RR,Red Rock,https://example.org,America/Denver\n"
                .as_bytes(),
        )
        .unwrap()
    }

    const ROUTES: &str = "\
route_id,route_short_name,route_long_name,route_type,route_color,route_text_color,route_sort_order,route_url
801,801,MetroRapid North Lamar,3,ffffff,000000,2,https://www.capmetro.org/801
550,,MetroRail Red Line,2,DB2128,FFFFFF,1,
7,7,Duval/Dove Springs,715,,,,
";

    #[test]
    fn parses_routes_with_defaults() {
        let registry = RouteRegistry::from_reader(&one_agency(), ROUTES.as_bytes()).unwrap();
        assert_eq!(registry.len(), 3);

        let rapid = registry.get("801").unwrap();
        assert_eq!(rapid.agency_id, "CM");
        assert_eq!(rapid.route_type, RouteType::Bus);
        assert_eq!(rapid.color, None);
        assert_eq!(rapid.text_color, None);

        let rail = registry.get("550").unwrap();
        assert_eq!(rail.short_name, None);
        assert_eq!(rail.color.as_deref(), Some("DB2128"));
        assert_eq!(rail.text_color.as_deref(), Some("FFFFFF"));

        assert_eq!(registry.get("7").unwrap().route_type, RouteType::Other(715));
    }

    #[test]
    fn orders_by_sort_order_then_id() {
        let registry = RouteRegistry::from_reader(&one_agency(), ROUTES.as_bytes()).unwrap();
        let ids: Vec<&str> = registry.all().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "550", "801"]);
        assert_eq!(registry.for_agency("CM").count(), 3);
        assert_eq!(registry.for_agency("RR").count(), 0);
    }

    #[test]
    fn renders_json() {
        let registry = RouteRegistry::from_reader(&one_agency(), ROUTES.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&registry.to_json().unwrap()).unwrap();
        assert_eq!(
            json[1],
            json!({
                "id": "550",
                "agencyId": "CM",
                "longName": "MetroRail Red Line",
                "type": 2,
                "color": "DB2128",
                "textColor": "FFFFFF",
                "sortOrder": 1
            })
        );
    }

    #[test]
    fn agency_must_be_explicit_with_several_agencies() {
        let csv = "route_id,route_short_name,route_type\n1,1,3\n";
        let err = RouteRegistry::from_reader(&two_agencies(), csv.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "routes.txt row 2: agency_id must not be blank");

        let csv = "route_id,agency_id,route_short_name,route_type\n1,XX,1,3\n";
        let err = RouteRegistry::from_reader(&two_agencies(), csv.as_bytes()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "routes.txt row 2: agency_id must reference known agency"
        );

        let csv = "route_id,agency_id,route_short_name,route_type\n1,RR,1,3\n";
        let registry = RouteRegistry::from_reader(&two_agencies(), csv.as_bytes()).unwrap();
        assert_eq!(registry.get("1").unwrap().agency_id, "RR");
    }

    #[test]
    fn rejects_invalid_rows() {
        let agencies = one_agency();
        let cases = [
            "route_id,route_type\n1,3\n",
            "route_id,route_short_name\n1,1\n",
            "route_id,route_short_name,route_type\n1,1,bus\n",
            "route_id,route_short_name,route_type,route_color\n1,1,3,+12345\n",
            "route_id,route_short_name,route_type,route_color\n1,1,3,12345\n",
            "route_id,route_short_name,route_type,route_sort_order\n1,1,3,-1\n",
            "route_id,route_short_name,route_type\n1,1,3\n1,2,3\n",
            "route_id,route_short_name,route_type\n",
        ];
        for csv in cases {
            assert!(
                RouteRegistry::from_reader(&agencies, csv.as_bytes()).is_err(),
                "accepted {csv:?}"
            );
        }
    }
}
