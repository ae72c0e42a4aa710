use crate::value::Value;

/// Resolves one property-path segment against a bound value.
///
/// Returning `None` means the segment does not exist on `object`; the binder
/// turns that into [`crate::DaoError::UnresolvedPropertyPath`]. Null
/// intermediates never reach the resolver.
pub trait PropertyResolver: Send + Sync {
    /// Returns the value of `segment` on `object`.
    fn get(&self, object: &Value, segment: &str) -> Option<Value>;
}

/// Default resolver over [`Value::Object`] properties and [`Value::List`]
/// indices.
#[derive(Clone, Copy, Debug, Default)]
pub struct ValueResolver;

impl PropertyResolver for ValueResolver {
    fn get(&self, object: &Value, segment: &str) -> Option<Value> {
        match object {
            Value::Object(props) => props.get(segment).cloned(),
            Value::List(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx).cloned()),
            _ => None,
        }
    }
}

impl<F> PropertyResolver for F
where
    F: Fn(&Value, &str) -> Option<Value> + Send + Sync,
{
    fn get(&self, object: &Value, segment: &str) -> Option<Value> {
        self(object, segment)
    }
}
