//! Service metadata as seen by the compiler.
//!
//! The compiler only talks to a [MetadataProvider]. [ServiceModel] is an
//! in-memory provider that can be loaded from YAML or JSON; it is what the
//! tests use and what callers use when they already hold the metadata.

use crate::error::{Error, ErrorType};
use crate::value::{ProtocolRevision, Value};

/// Resolved member of an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    Structural {
        name: String,
    },
    Navigation {
        name: String,
        target: String,
        multiple: bool,
    },
}

impl Member {
    pub fn name(&self) -> &str {
        match self {
            Member::Structural { name } => name,
            Member::Navigation { name, .. } => name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Function,
    Action,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    DateTime,
    Guid,
    Any,
}

impl Default for ParamType {
    fn default() -> Self {
        ParamType::Any
    }
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ParamType::Any, _) => true,
            (ParamType::String, Value::String(_)) => true,
            (ParamType::Integer, v) => v.is_integer(),
            (ParamType::Number, Value::Single(_) | Value::Double(_) | Value::Decimal(_)) => true,
            (ParamType::Number, v) => v.is_integer(),
            (ParamType::Boolean, Value::Boolean(_)) => true,
            (ParamType::DateTime, Value::DateTime(_) | Value::DateTimeOffset(_)) => true,
            (ParamType::Guid, Value::Guid(_)) => true,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionParameter {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub optional: bool,
}

/// Signature of a service function or action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    pub name: String,
    pub kind: FunctionKind,
    #[serde(default)]
    pub parameters: Vec<FunctionParameter>,
    /// Collection returned by the function, if it returns entities.
    #[serde(default)]
    pub returns: Option<String>,
}

impl FunctionSignature {
    pub fn parameter(&self, name: &str) -> Option<&FunctionParameter> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .or_else(|| {
                let name = homogenize_name(name);
                self.parameters
                    .iter()
                    .find(|p| homogenize_name(&p.name) == name)
            })
    }
}

/// Source of the metadata the compiler needs.
///
/// Names passed in may be spelled loosely; implementations return the declared names.
pub trait MetadataProvider: Send + Sync {
    fn protocol_revision(&self) -> ProtocolRevision;

    /// Declared name of a collection.
    fn resolve_collection(&self, name: &str) -> Result<String, Error>;

    /// Key property names in declaration order.
    fn get_declared_key_names(&self, collection: &str) -> Result<Vec<String>, Error>;

    fn resolve_member(&self, collection: &str, name: &str) -> Result<Member, Error>;

    fn get_navigation_target(&self, collection: &str, name: &str) -> Result<String, Error> {
        match self.resolve_member(collection, name)? {
            Member::Navigation { target, .. } => Ok(target),
            Member::Structural { name } => Err(Error::new(
                ErrorType::UnknownMember,
                format!("'{}' is not a navigation property of '{}'", name, collection),
            )
            .with_collection(collection)),
        }
    }

    /// Qualified name of a type derived from the collection's entity type.
    fn resolve_derived_type(&self, collection: &str, name: &str) -> Result<String, Error>;

    fn get_function_signature(&self, name: &str) -> Option<FunctionSignature>;
}

/// Lower-cased name without underscores and without a trailing plural `s`.
pub fn homogenize_name(name: &str) -> String {
    let mut name = crate::functions::homogenize(name);
    if name.len() > 1 && name.ends_with('s') {
        name.pop();
    }
    name
}

fn find_by_name<'a, T, F>(items: &'a [T], name: &str, get_name: F) -> Option<&'a T>
where
    F: Fn(&T) -> &str,
{
    items.iter().find(|x| get_name(x) == name).or_else(|| {
        let name = homogenize_name(name);
        items.iter().find(|x| homogenize_name(get_name(x)) == name)
    })
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NavigationProperty {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DerivedType {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub navigations: Vec<NavigationProperty>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CollectionModel {
    pub name: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub properties: Vec<String>,
    #[serde(default)]
    pub navigations: Vec<NavigationProperty>,
    #[serde(default)]
    pub derived_types: Vec<DerivedType>,
}

impl CollectionModel {
    pub fn new(name: &str) -> Self {
        CollectionModel {
            name: name.to_owned(),
            keys: Vec::new(),
            properties: Vec::new(),
            navigations: Vec::new(),
            derived_types: Vec::new(),
        }
    }

    /// Declare a key property; it is also a structural property.
    pub fn with_key(mut self, name: &str) -> Self {
        self.keys.push(name.to_owned());
        if !self.properties.iter().any(|p| p == name) {
            self.properties.push(name.to_owned());
        }
        self
    }

    pub fn with_property(mut self, name: &str) -> Self {
        self.properties.push(name.to_owned());
        self
    }

    pub fn with_navigation(mut self, name: &str, target: &str, multiple: bool) -> Self {
        self.navigations.push(NavigationProperty {
            name: name.to_owned(),
            target: target.to_owned(),
            multiple,
        });
        self
    }

    fn find_member(&self, name: &str) -> Option<Member> {
        let properties = self
            .properties
            .iter()
            .chain(self.derived_types.iter().flat_map(|t| t.properties.iter()))
            .cloned()
            .collect::<Vec<_>>();
        let navigations = self
            .navigations
            .iter()
            .chain(self.derived_types.iter().flat_map(|t| t.navigations.iter()))
            .cloned()
            .collect::<Vec<_>>();

        // exact spelling wins over a loose match of the other kind
        if let Some(p) = properties.iter().find(|p| *p == name) {
            return Some(Member::Structural { name: p.clone() });
        }
        if let Some(n) = find_by_name(&navigations, name, |n| n.name.as_str()) {
            return Some(Member::Navigation {
                name: n.name.clone(),
                target: n.target.clone(),
                multiple: n.multiple,
            });
        }
        find_by_name(&properties, name, |p| p.as_str()).map(|p| Member::Structural { name: p.clone() })
    }
}

/// In-memory metadata snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceModel {
    #[serde(default)]
    pub revision: ProtocolRevision,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub collections: Vec<CollectionModel>,
    #[serde(default)]
    pub functions: Vec<FunctionSignature>,
}

impl ServiceModel {
    pub fn new(namespace: &str, revision: ProtocolRevision) -> Self {
        ServiceModel {
            revision,
            namespace: namespace.to_owned(),
            collections: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn with_collection(mut self, collection: CollectionModel) -> Self {
        self.collections.push(collection);
        self
    }

    pub fn with_function(mut self, function: FunctionSignature) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_revision(mut self, revision: ProtocolRevision) -> Self {
        self.revision = revision;
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            Error::new(
                ErrorType::ParseError,
                format!("Failed to parse YAML service model: {}", e),
            )
        })
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            Error::new(
                ErrorType::ParseError,
                format!("Failed to parse JSON service model: {}", e),
            )
        })
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization_error("service model", e))
    }

    pub fn collection(&self, name: &str) -> Result<&CollectionModel, Error> {
        find_by_name(&self.collections, name, |c| c.name.as_str())
            .ok_or_else(|| Error::unknown_collection(name))
    }
}

impl MetadataProvider for ServiceModel {
    fn protocol_revision(&self) -> ProtocolRevision {
        self.revision
    }

    fn resolve_collection(&self, name: &str) -> Result<String, Error> {
        Ok(self.collection(name)?.name.clone())
    }

    fn get_declared_key_names(&self, collection: &str) -> Result<Vec<String>, Error> {
        Ok(self.collection(collection)?.keys.clone())
    }

    fn resolve_member(&self, collection: &str, name: &str) -> Result<Member, Error> {
        let model = self.collection(collection)?;
        model
            .find_member(name)
            .ok_or_else(|| Error::unknown_member(&model.name, &[name.to_owned()]))
    }

    fn resolve_derived_type(&self, collection: &str, name: &str) -> Result<String, Error> {
        let model = self.collection(collection)?;
        let short = name.rsplit('.').next().unwrap_or(name);
        let derived = find_by_name(&model.derived_types, short, |t| t.name.as_str()).ok_or_else(|| {
            Error::new(
                ErrorType::UnknownMember,
                format!("Type '{}' is not derived from the type of '{}'", name, model.name),
            )
            .with_collection(&model.name)
        })?;
        if self.namespace.is_empty() {
            Ok(derived.name.clone())
        } else {
            Ok(format!("{}.{}", self.namespace, derived.name))
        }
    }

    fn get_function_signature(&self, name: &str) -> Option<FunctionSignature> {
        find_by_name(&self.functions, name, |f| f.name.as_str()).cloned()
    }
}

#[cfg(test)]
pub(crate) fn northwind() -> ServiceModel {
    match ServiceModel::from_yaml(include_str!("../tests/data/northwind.yaml")) {
        Ok(model) => model,
        Err(e) => panic!("{}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_homogenized() -> Result<(), Error> {
        let model = northwind();
        assert_eq!(model.resolve_collection("OrderDetails")?, "Order_Details");
        assert_eq!(model.resolve_collection("products")?, "Products");
        assert_eq!(
            model.resolve_member("Products", "Product_Name")?,
            Member::Structural {
                name: "ProductName".to_owned()
            }
        );
        assert!(model.resolve_collection("Nothing").is_err());
        Ok(())
    }

    #[test]
    fn keys_in_declared_order() -> Result<(), Error> {
        let model = northwind();
        assert_eq!(
            model.get_declared_key_names("Order_Details")?,
            vec!["OrderID".to_owned(), "ProductID".to_owned()]
        );
        Ok(())
    }

    #[test]
    fn navigation_targets() -> Result<(), Error> {
        let model = northwind();
        assert_eq!(model.get_navigation_target("Employees", "Superior")?, "Employees");
        assert_eq!(model.get_navigation_target("Orders", "Order_Details")?, "Order_Details");
        match model.resolve_member("Customers", "Orders")? {
            Member::Navigation { multiple, .. } => assert!(multiple),
            other => panic!("unexpected {:?}", other),
        }
        let e = model.get_navigation_target("Products", "ProductName").unwrap_err();
        assert_eq!(e.error_type, ErrorType::UnknownMember);
        Ok(())
    }

    #[test]
    fn derived_types_are_qualified() -> Result<(), Error> {
        let model = northwind();
        assert_eq!(model.resolve_derived_type("Transport", "Ship")?, "NorthwindModel.Ships");
        assert_eq!(
            model.resolve_derived_type("Transport", "NorthwindModel.Ships")?,
            "NorthwindModel.Ships"
        );
        // derived type members are visible from the base collection
        assert!(model.resolve_member("Transport", "ShipName").is_ok());
        Ok(())
    }

    #[test]
    fn function_signatures() {
        let model = northwind();
        let f = model.get_function_signature("ParseInt").unwrap();
        assert_eq!(f.kind, FunctionKind::Function);
        assert_eq!(f.parameter("number").unwrap().param_type, ParamType::String);
        assert!(model.get_function_signature("Missing").is_none());
        assert!(ParamType::Integer.accepts(&Value::Int64(1)));
        assert!(!ParamType::Integer.accepts(&Value::from("1")));
    }

    #[test]
    fn builder_and_json() -> Result<(), Error> {
        let model = ServiceModel::new("Test", ProtocolRevision::V2).with_collection(
            CollectionModel::new("Items")
                .with_key("Id")
                .with_property("Name")
                .with_navigation("Parent", "Items", false),
        );
        let json = serde_json::to_string(&model).unwrap();
        let back = ServiceModel::from_json(&json)?;
        assert_eq!(back, model);
        assert_eq!(back.get_declared_key_names("Items")?, vec!["Id".to_owned()]);
        Ok(())
    }
}
