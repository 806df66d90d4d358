use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use ahash::AHashMap;
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{csv_reader, non_blank, parse_url, warn_unknown_columns};
use crate::error::{Error, Result};

const FILE: &str = "agency.txt";

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[A-Za-z][A-Za-z0-9-]*[A-Za-z0-9]$").expect("valid e-mail pattern")
});

const COLUMNS: [&str; 8] = [
    "agency_id",
    "agency_name",
    "agency_url",
    "agency_timezone",
    "agency_lang",
    "agency_phone",
    "agency_fare_url",
    "agency_email",
];

#[derive(Deserialize, Debug, Default)]
struct AgencyRow {
    agency_id: Option<String>,
    agency_name: Option<String>,
    agency_url: Option<String>,
    agency_timezone: Option<String>,
    agency_lang: Option<String>,
    agency_phone: Option<String>,
    agency_fare_url: Option<String>,
    agency_email: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Agency {
    pub id: String,
    pub name: String,
    pub url: String,
    pub timezone: Tz,
    pub lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fare_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Agency {
    fn from_row(row: AgencyRow, line: u64) -> Result<Self> {
        let required = |value: Option<String>, column: &str| {
            non_blank(value)
                .ok_or_else(|| Error::static_data(FILE, line, format!("{column} cannot be blank")))
        };

        let id = required(row.agency_id, "agency_id")?;
        let name = required(row.agency_name, "agency_name")?;
        let url = parse_url(FILE, line, "agency_url", row.agency_url)?
            .ok_or_else(|| Error::static_data(FILE, line, "agency_url cannot be blank"))?;
        let timezone = required(row.agency_timezone, "agency_timezone")?
            .parse::<Tz>()
            .map_err(|e| Error::static_data(FILE, line, format!("agency_timezone: {e}")))?;
        let fare_url = parse_url(FILE, line, "agency_fare_url", row.agency_fare_url)?;

        let email = non_blank(row.agency_email);
        if let Some(email) = &email {
            if !EMAIL.is_match(email) {
                return Err(Error::static_data(
                    FILE,
                    line,
                    "agency_email must specify a valid email address",
                ));
            }
        }

        Ok(Self {
            id,
            name,
            url,
            timezone,
            lang: non_blank(row.agency_lang).unwrap_or_else(|| "en".to_string()),
            phone: non_blank(row.agency_phone),
            fare_url,
            email,
        })
    }
}

/// Agencies keyed by `agency_id`. Never empty.
#[derive(Debug, Clone)]
pub struct AgencyRegistry {
    agencies: AHashMap<String, Agency>,
    default_agency: String,
}

impl AgencyRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv_reader(reader);
        warn_unknown_columns(FILE, reader.headers()?, &COLUMNS);

        let mut agencies = AHashMap::new();
        let mut default_agency = None;

        for (index, row) in reader.deserialize::<AgencyRow>().enumerate() {
            // Header is line 1.
            let line = index as u64 + 2;
            let agency = Agency::from_row(row?, line)?;

            if agencies.contains_key(&agency.id) {
                return Err(Error::static_data(FILE, line, "agency_id must be unique"));
            }
            default_agency.get_or_insert_with(|| agency.id.clone());
            agencies.insert(agency.id.clone(), agency);
        }

        let default_agency = default_agency
            .ok_or_else(|| Error::static_data(FILE, 1, "must specify at least one agency"))?;

        Ok(Self {
            agencies,
            default_agency,
        })
    }

    pub fn len(&self) -> usize {
        self.agencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agencies.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Agency> {
        self.agencies.get(id)
    }

    /// The first agency listed in the file.
    pub fn default_agency(&self) -> &Agency {
        &self.agencies[&self.default_agency]
    }

    /// All agencies ordered by id.
    pub fn all(&self) -> Vec<&Agency> {
        let mut agencies: Vec<&Agency> = self.agencies.values().collect();
        agencies.sort_by(|a, b| a.id.cmp(&b.id));
        agencies
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENCIES: &str = "\
agency_id,agency_name,agency_url,agency_timezone,agency_lang,agency_phone,agency_email,extra
CM,Capital Metro,https://www.capmetro.org,America/Chicago,,512-474-1200,info@capmetro.org,x
RR,Red Rock Transit,https://example.org,America/Denver,es,,,
";

    #[test]
    fn parses_agencies_and_defaults() {
        let registry = AgencyRegistry::from_reader(AGENCIES.as_bytes()).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.default_agency().id, "CM");

        let cm = registry.get("CM").unwrap();
        assert_eq!(cm.timezone, chrono_tz::America::Chicago);
        assert_eq!(cm.lang, "en");
        assert_eq!(cm.phone.as_deref(), Some("512-474-1200"));
        assert_eq!(cm.email.as_deref(), Some("info@capmetro.org"));

        let rr = registry.get("RR").unwrap();
        assert_eq!(rr.lang, "es");
        assert_eq!(rr.phone, None);
        assert_eq!(rr.email, None);
    }

    #[test]
    fn renders_json_without_absent_fields() {
        let registry = AgencyRegistry::from_reader(AGENCIES.as_bytes()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&registry.to_json().unwrap()).unwrap();
        assert_eq!(json[1]["id"], "RR");
        assert_eq!(json[1]["timezone"], "America/Denver");
        assert!(json[1].get("phone").is_none());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let csv = "agency_id,agency_name,agency_url,agency_timezone\nA,,https://a.org,UTC\n";
        let err = AgencyRegistry::from_reader(csv.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "agency.txt row 2: agency_name cannot be blank");
    }

    #[test]
    fn rejects_bad_timezone_url_and_email() {
        let tz = "agency_id,agency_name,agency_url,agency_timezone\nA,A,https://a.org,Mars/Base\n";
        assert!(AgencyRegistry::from_reader(tz.as_bytes()).is_err());

        let url = "agency_id,agency_name,agency_url,agency_timezone\nA,A,not a url,UTC\n";
        assert!(AgencyRegistry::from_reader(url.as_bytes()).is_err());

        let email =
            "agency_id,agency_name,agency_url,agency_timezone,agency_email\nA,A,https://a.org,UTC,nobody\n";
        assert!(AgencyRegistry::from_reader(email.as_bytes()).is_err());
    }

    #[test]
    fn email_pattern() {
        for ok in ["info@capmetro.org", "a.b+c@mail.example.co"] {
            assert!(EMAIL.is_match(ok), "{ok}");
        }
        for bad in ["nobody", "a@b", "a b@c.org", "a@@c.org", "a@c.o-"] {
            assert!(!EMAIL.is_match(bad), "{bad}");
        }
    }

    #[test]
    fn rejects_duplicates_and_empty_files() {
        let dup = "agency_id,agency_name,agency_url,agency_timezone\n\
A,A,https://a.org,UTC\n\
A,B,https://b.org,UTC\n";
        let err = AgencyRegistry::from_reader(dup.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "agency.txt row 3: agency_id must be unique");

        let empty = "agency_id,agency_name,agency_url,agency_timezone\n";
        assert!(AgencyRegistry::from_reader(empty.as_bytes()).is_err());
    }
}
