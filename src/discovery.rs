//! Field discovery
//!
//! Deployments of the same CRM schema disagree on field names: one org has
//! `Country__c`, another `Mailing_Country__c`, a third only the standard
//! `MailingCountry`. Each semantic [`FieldRole`] carries a ranked list of
//! candidate patterns which is scanned against the entity's field catalog; the
//! first structural match wins.
//!
//! ```text
//! describe(entity) ──once──► FieldCatalog
//!                                 │
//! FieldRole ──► candidates ──► resolve_in_catalog ──► Option<ResolvedField>
//! ```
//!
//! Resolution never fails a request. A missing field or a failed schema fetch
//! both come back as `None`, which callers treat as "dimension unavailable".

use crate::source::{FieldDescriptor, RemoteSource};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Semantic field request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldRole {
    Country,
    Language,
    Age,
    BirthDate,
    Gender,
    Education,
    Status,
    Type,
    Source,
    /// Reference field pointing at the named entity
    Reference(String),
}

impl FieldRole {
    pub fn name(&self) -> String {
        match self {
            FieldRole::Country => "country".to_string(),
            FieldRole::Language => "language".to_string(),
            FieldRole::Age => "age".to_string(),
            FieldRole::BirthDate => "birthdate".to_string(),
            FieldRole::Gender => "gender".to_string(),
            FieldRole::Education => "education".to_string(),
            FieldRole::Status => "status".to_string(),
            FieldRole::Type => "type".to_string(),
            FieldRole::Source => "source".to_string(),
            FieldRole::Reference(target) => format!("reference:{}", target),
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        if lower.starts_with("reference:") {
            let target = &s["reference:".len()..];
            return if target.is_empty() {
                None
            } else {
                Some(FieldRole::Reference(target.to_string()))
            };
        }

        match lower.as_str() {
            "country" => Some(FieldRole::Country),
            "language" => Some(FieldRole::Language),
            "age" => Some(FieldRole::Age),
            "birthdate" => Some(FieldRole::BirthDate),
            "gender" => Some(FieldRole::Gender),
            "education" => Some(FieldRole::Education),
            "status" => Some(FieldRole::Status),
            "type" => Some(FieldRole::Type),
            "source" => Some(FieldRole::Source),
            _ => None,
        }
    }

    /// Ranked candidate patterns, most specific first
    fn candidates(&self) -> Vec<Candidate> {
        let exact = |names: &[&str]| names.iter().map(|n| Candidate::Exact(n.to_string())).collect::<Vec<_>>();

        let (mut list, keyword) = match self {
            FieldRole::Country => (
                exact(&["Country__c", "Mailing_Country__c", "MailingCountry", "Country", "BillingCountry"]),
                "country",
            ),
            FieldRole::Language => (
                exact(&["Language__c", "Primary_Language__c", "Languages__c", "Language"]),
                "language",
            ),
            FieldRole::Age => (exact(&["Age__c", "Age"]), "age"),
            FieldRole::BirthDate => (
                exact(&["Birthdate", "Birth_Date__c", "Date_of_Birth__c", "DOB__c"]),
                "birth",
            ),
            FieldRole::Gender => (exact(&["Gender__c", "Gender", "GenderIdentity"]), "gender"),
            FieldRole::Education => (
                exact(&["Education__c", "Education_Level__c", "Highest_Education__c"]),
                "education",
            ),
            FieldRole::Status => (exact(&["Status__c", "Status"]), "status"),
            FieldRole::Type => (exact(&["Type__c", "Type"]), "type"),
            FieldRole::Source => (exact(&["LeadSource", "Source__c", "Lead_Source__c", "Source"]), "source"),
            FieldRole::Reference(target) => {
                let base = target.strip_suffix("__c").unwrap_or(target);
                return vec![
                    Candidate::ReferenceTo { target: target.clone(), custom: false },
                    Candidate::ReferenceTo { target: target.clone(), custom: true },
                    Candidate::Exact(format!("{}Id", base)),
                    Candidate::Exact(format!("{}__c", base)),
                    Candidate::Exact(base.to_string()),
                ];
            }
        };

        list.push(Candidate::CustomKeyword(keyword));
        list.push(Candidate::LabelKeyword(keyword));
        list
    }
}

enum Candidate {
    /// Exact API name, case-insensitive
    Exact(String),
    /// Custom (`__c`) non-reference field whose name mentions the keyword
    CustomKeyword(&'static str),
    /// Non-reference field whose label mentions the keyword
    LabelKeyword(&'static str),
    /// Reference field targeting the entity; standard fields rank before custom ones
    ReferenceTo { target: String, custom: bool },
}

impl Candidate {
    fn matches(&self, field: &FieldDescriptor) -> bool {
        match self {
            Candidate::Exact(name) => field.name.eq_ignore_ascii_case(name),
            Candidate::CustomKeyword(keyword) => {
                is_custom(&field.name) && is_dimension_field(field) && mentions(&field.name, keyword, '_')
            }
            Candidate::LabelKeyword(keyword) => {
                is_dimension_field(field)
                    && field
                        .label
                        .as_deref()
                        .map(|label| mentions(label, keyword, ' '))
                        .unwrap_or(false)
            }
            Candidate::ReferenceTo { target, custom } => {
                field.is_reference()
                    && is_custom(&field.name) == *custom
                    && field.reference_to.iter().any(|t| t.eq_ignore_ascii_case(target))
            }
        }
    }
}

fn is_custom(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with("__c")
}

fn is_dimension_field(field: &FieldDescriptor) -> bool {
    !field.is_reference() && !field.field_type.eq_ignore_ascii_case("id")
}

/// Short keywords ("age", "type") must match a whole word so that `Stage__c`
/// or `Language__c` do not count as an age field; longer keywords may match
/// anywhere in the name.
fn mentions(text: &str, keyword: &str, separator: char) -> bool {
    let lower = text.to_ascii_lowercase();
    if keyword.len() >= 5 {
        return lower.contains(keyword);
    }
    lower
        .trim_end_matches("__c")
        .split(|c: char| c == separator || c == '_')
        .any(|token| token == keyword)
}

/// Relationship name used to traverse a reference field in a single query
fn relationship_name(field: &FieldDescriptor) -> String {
    if let Some(name) = &field.relationship_name {
        return name.clone();
    }

    let name = &field.name;
    if is_custom(name) {
        format!("{}__r", &name[..name.len() - 3])
    } else if name.len() > 2 && name.ends_with("Id") {
        name[..name.len() - 2].to_string()
    } else {
        name.clone()
    }
}

/// Field catalog of one entity
#[derive(Debug, Clone)]
pub struct FieldCatalog {
    pub entity: String,
    pub fields: Vec<FieldDescriptor>,
}

impl FieldCatalog {
    pub fn new(entity: &str, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            entity: entity.to_string(),
            fields,
        }
    }
}

/// Concrete field resolved for a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedField {
    pub entity_type: String,
    pub role_name: String,
    pub field_name: String,
    /// Only set for reference roles
    pub relationship_name: Option<String>,
}

/// Scan the role's candidates in rank order against a catalog
pub fn resolve_in_catalog(catalog: &FieldCatalog, role: &FieldRole) -> Option<ResolvedField> {
    for candidate in role.candidates() {
        if let Some(field) = catalog.fields.iter().find(|f| candidate.matches(f)) {
            let relationship_name = match role {
                FieldRole::Reference(_) => Some(relationship_name(field)),
                _ => None,
            };

            return Some(ResolvedField {
                entity_type: catalog.entity.clone(),
                role_name: role.name(),
                field_name: field.name.clone(),
                relationship_name,
            });
        }
    }

    None
}

/// Resolves roles against catalogs fetched once per entity and memoizes results
pub struct FieldDiscovery {
    source: Arc<dyn RemoteSource>,
    catalogs: RwLock<HashMap<String, Arc<FieldCatalog>>>,
    resolved: RwLock<HashMap<(String, FieldRole), Option<ResolvedField>>>,
}

impl FieldDiscovery {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            catalogs: RwLock::new(HashMap::new()),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Field catalog for an entity, fetched on first use
    pub async fn catalog(&self, entity: &str) -> Option<Arc<FieldCatalog>> {
        if let Some(catalog) = self
            .catalogs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity)
        {
            return Some(Arc::clone(catalog));
        }

        match self.source.describe(entity).await {
            Ok(describe) => {
                log::info!("📋 Loaded field catalog for {} ({} fields)", entity, describe.fields.len());
                let catalog = Arc::new(FieldCatalog::new(entity, describe.fields));
                self.catalogs
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(entity.to_string(), Arc::clone(&catalog));
                Some(catalog)
            }
            Err(e) => {
                // Not cached, so the next request retries the describe call
                log::warn!("⚠️  Schema fetch failed for {}: {}", entity, e);
                None
            }
        }
    }

    /// Resolve one role; `None` means the dimension is unavailable
    pub async fn resolve(&self, entity: &str, role: &FieldRole) -> Option<ResolvedField> {
        let key = (entity.to_string(), role.clone());
        if let Some(hit) = self
            .resolved
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return hit.clone();
        }

        let catalog = self.catalog(entity).await?;
        let resolved = resolve_in_catalog(&catalog, role);

        match &resolved {
            Some(field) => log::debug!("🔎 {}.{} → {}", entity, role.name(), field.field_name),
            None => log::info!("🔎 {}.{} not found in schema, dimension omitted", entity, role.name()),
        }

        self.resolved
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, resolved.clone());
        resolved
    }

    /// Resolve several roles, dropping the ones that are unavailable
    pub async fn resolve_all(&self, entity: &str, roles: &[FieldRole]) -> Vec<(FieldRole, ResolvedField)> {
        let mut out = Vec::with_capacity(roles.len());
        for role in roles {
            if let Some(field) = self.resolve(entity, role).await {
                out.push((role.clone(), field));
            }
        }
        out
    }

    /// Forget cached catalogs and resolutions (after a remote schema change)
    pub fn invalidate(&self) {
        self.catalogs.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.resolved.write().unwrap_or_else(PoisonError::into_inner).clear();
        log::info!("🔄 Field discovery caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySource, Record};

    fn catalog(fields: Vec<FieldDescriptor>) -> FieldCatalog {
        FieldCatalog::new("Contact", fields)
    }

    #[test]
    fn test_exact_name_beats_heuristic() {
        let catalog = catalog(vec![
            FieldDescriptor::new("Home_Country_Code__c", "string"),
            FieldDescriptor::new("Mailing_Country__c", "picklist"),
        ]);

        let resolved = resolve_in_catalog(&catalog, &FieldRole::Country).unwrap();
        assert_eq!(resolved.field_name, "Mailing_Country__c");
        assert_eq!(resolved.relationship_name, None);
    }

    #[test]
    fn test_custom_suffix_heuristic() {
        let catalog = catalog(vec![
            FieldDescriptor::new("Name", "string"),
            FieldDescriptor::new("Spoken_Languages__c", "multipicklist"),
        ]);

        let resolved = resolve_in_catalog(&catalog, &FieldRole::Language).unwrap();
        assert_eq!(resolved.field_name, "Spoken_Languages__c");
    }

    #[test]
    fn test_short_keyword_needs_whole_word() {
        let catalog = catalog(vec![
            FieldDescriptor::new("Stage__c", "picklist"),
            FieldDescriptor::new("Language__c", "picklist"),
        ]);
        assert_eq!(resolve_in_catalog(&catalog, &FieldRole::Age), None);

        let catalog = self::catalog(vec![FieldDescriptor::new("Contributor_Age__c", "number")]);
        assert_eq!(
            resolve_in_catalog(&catalog, &FieldRole::Age).map(|f| f.field_name),
            Some("Contributor_Age__c".to_string())
        );
    }

    #[test]
    fn test_label_fallback() {
        let catalog = catalog(vec![FieldDescriptor::new("Pronoun_Set__c", "picklist").with_label("Gender Identity")]);
        assert_eq!(
            resolve_in_catalog(&catalog, &FieldRole::Gender).map(|f| f.field_name),
            Some("Pronoun_Set__c".to_string())
        );
    }

    #[test]
    fn test_reference_prefers_standard_field() {
        let catalog = FieldCatalog::new(
            "Case",
            vec![
                FieldDescriptor::reference("Backup_Contact__c", "Contact", None),
                FieldDescriptor::reference("ContactId", "Contact", None),
            ],
        );

        let resolved = resolve_in_catalog(&catalog, &FieldRole::Reference("Contact".to_string())).unwrap();
        assert_eq!(resolved.field_name, "ContactId");
        assert_eq!(resolved.relationship_name.as_deref(), Some("Contact"));
    }

    #[test]
    fn test_reference_relationship_derived_from_custom_name() {
        let catalog = FieldCatalog::new(
            "Project_Assignment__c",
            vec![FieldDescriptor::reference("Contributor__c", "Contact", None)],
        );

        let resolved = resolve_in_catalog(&catalog, &FieldRole::Reference("Contact".to_string())).unwrap();
        assert_eq!(resolved.field_name, "Contributor__c");
        assert_eq!(resolved.relationship_name.as_deref(), Some("Contributor__r"));
    }

    #[test]
    fn test_reference_by_name_convention() {
        // Some orgs expose the lookup as a plain text id column
        let catalog = FieldCatalog::new(
            "Project_Assignment__c",
            vec![FieldDescriptor::new("Project__c", "string")],
        );

        let resolved = resolve_in_catalog(&catalog, &FieldRole::Reference("Project__c".to_string())).unwrap();
        assert_eq!(resolved.field_name, "Project__c");
        assert_eq!(resolved.relationship_name.as_deref(), Some("Project__r"));
    }

    #[test]
    fn test_role_names_round_trip() {
        for role in [
            FieldRole::Country,
            FieldRole::BirthDate,
            FieldRole::Source,
            FieldRole::Reference("Contact".to_string()),
        ] {
            assert_eq!(FieldRole::from_str(&role.name()), Some(role.clone()));
        }
        assert_eq!(FieldRole::from_str("reference:"), None);
        assert_eq!(FieldRole::from_str("favourite_colour"), None);
    }

    #[tokio::test]
    async fn test_catalog_fetched_once() {
        let source = Arc::new(MemorySource::new().with_entity(
            "Contact",
            vec![FieldDescriptor::new("Id", "id"), FieldDescriptor::new("Gender__c", "picklist")],
            vec![Record::new().with("Id", "1")],
        ));
        let discovery = FieldDiscovery::new(source.clone());

        assert!(discovery.resolve("Contact", &FieldRole::Gender).await.is_some());
        assert!(discovery.resolve("Contact", &FieldRole::Country).await.is_none());
        assert!(discovery.resolve("Contact", &FieldRole::Gender).await.is_some());
        assert_eq!(source.describe_calls(), 1);

        discovery.invalidate();
        assert!(discovery.resolve("Contact", &FieldRole::Gender).await.is_some());
        assert_eq!(source.describe_calls(), 2);
    }

    #[tokio::test]
    async fn test_schema_failure_is_not_found() {
        let source = Arc::new(MemorySource::new().failing_describe());
        let discovery = FieldDiscovery::new(source.clone());

        assert_eq!(discovery.resolve("Contact", &FieldRole::Country).await, None);
        assert!(discovery.resolve_all("Contact", &[FieldRole::Country, FieldRole::Gender]).await.is_empty());
    }
}
