//! Filter parameters shared by list and watch calls

/// Common query parameters used in list/watch calls on collections
///
/// The same parameters are handed to [`ListWatch::list`](crate::ListWatch::list) and
/// [`ListWatch::watch`](crate::ListWatch::watch) so that the watch observes exactly
/// the collection that was listed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListParams {
    /// Restrict the collection to a single namespace.
    ///
    /// Defaults to all namespaces if `None`.
    pub namespace: Option<String>,

    /// A selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything if `None`.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything if `None`.
    pub field_selector: Option<String>,

    /// Timeout for the list/watch call.
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    pub timeout: Option<u32>,
}

/// Builder interface to ListParams
///
/// Usage:
/// ```
/// use informer_core::params::ListParams;
/// let lp = ListParams::default()
///     .within("default")
///     .timeout(60)
///     .labels("app=web");
/// assert_eq!(lp.namespace.as_deref(), Some("default"));
/// ```
impl ListParams {
    /// Restrict the collection to the given namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Configure the timeout for list/watch calls
    ///
    /// This limits the duration of the call, regardless of any activity or inactivity.
    /// A watch that times out simply ends and is reopened from the last seen version.
    #[must_use]
    pub fn timeout(mut self, timeout_secs: u32) -> Self {
        self.timeout = Some(timeout_secs);
        self
    }

    /// Configure the selector to restrict the list of returned objects by their fields.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `key1=value1,key2=value2`.
    /// The server only supports a limited number of field queries per type.
    #[must_use]
    pub fn fields(mut self, field_selector: &str) -> Self {
        self.field_selector = Some(field_selector.to_string());
        self
    }

    /// Configure the selector to restrict the list of returned objects by their labels.
    ///
    /// Defaults to everything.
    /// Supports `=`, `==`, `!=`, and can be comma separated: `key1=value1,key2=value2`.
    #[must_use]
    pub fn labels(mut self, label_selector: &str) -> Self {
        self.label_selector = Some(label_selector.to_string());
        self
    }
}
