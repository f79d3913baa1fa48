use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, parse_macro_input};

/// Derive macro for implementing the `AuditRecord` trait.
///
/// # Struct-level Attribute
///
/// Use `#[audit("custom_action_name")]` on the struct to override the action name.
/// By default, the action name is the struct name in snake_case with a trailing
/// `_record` removed, so `TopicCreatedRecord` logs as `topic_created`.
///
/// # Field Attributes
///
/// - `#[audit(skip)]` - Never log this field
/// - `#[audit(debug)]` - Use Debug formatting (`?`) instead of the default Display formatting (`%`)
/// - `#[audit(skip_none)]` - For `Option<T>` fields: omit the field when `None`, log the inner value when `Some`
///
/// Attributes can be combined, e.g., `#[audit(skip_none, debug)]`
///
/// The generated code expects `AuditRecord`, `AuditContextData` and `AUDIT_LOG_EVENT_SOURCE`
/// to be in scope at the derive site.
///
/// # Examples
///
/// ```ignore
/// use broker_audit_logging_derive::AuditRecord;
///
/// #[derive(AuditRecord)]
/// #[audit("topic_purged")]
/// struct PurgeRecord {
///     topic: String,
///     #[audit(skip)]
///     internal_handle: u64,
///     #[audit(skip_none)]
///     error: Option<String>,
///     #[audit(debug)]
///     partitions: Vec<i32>,
/// }
/// ```
#[proc_macro_derive(AuditRecord, attributes(audit))]
pub fn derive_audit_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let action = input
        .attrs
        .iter()
        .find(|a| a.path().is_ident("audit"))
        .and_then(|a| a.parse_args::<syn::LitStr>().ok())
        .map(|lit| lit.value())
        .unwrap_or_else(|| default_action_name(&name.to_string()));

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => panic!("AuditRecord only supports named fields"),
        },
        _ => panic!("AuditRecord only supports structs"),
    };

    let field_attrs: Vec<FieldAttrs> = fields.iter().map(parse_field_attrs).collect();

    let static_field_logs: Vec<_> = fields
        .iter()
        .zip(field_attrs.iter())
        .filter(|(_, attrs)| !attrs.skip && !attrs.skip_none)
        .map(|(field, attrs)| generate_field_log(field.ident.as_ref(), attrs))
        .collect();

    let optional_fields: Vec<_> = fields
        .iter()
        .zip(field_attrs.iter())
        .filter(|(_, attrs)| !attrs.skip && attrs.skip_none)
        .collect();

    let optional_empty_fields: Vec<_> = optional_fields
        .iter()
        .map(|(field, _)| {
            let name = &field.ident;
            quote! { #name = tracing::field::Empty }
        })
        .collect();

    let optional_records: Vec<_> = optional_fields
        .iter()
        .map(|(field, attrs)| {
            let name = &field.ident;
            let name_str = name.as_ref().map(ToString::to_string).unwrap_or_default();
            if attrs.debug {
                quote! {
                    if let Some(ref val) = self.#name {
                        span.record(#name_str, tracing::field::debug(val));
                    }
                }
            } else {
                quote! {
                    if let Some(ref val) = self.#name {
                        span.record(#name_str, tracing::field::display(val));
                    }
                }
            }
        })
        .collect();

    let expanded = quote! {
        impl AuditRecord for #name {
            fn action(&self) -> &'static str {
                #action
            }

            fn log<D: AuditContextData>(&self, ctx: &D) {
                let request_context = ctx.request_context();

                let span = tracing::info_span!(
                    #action,
                    event_source = AUDIT_LOG_EVENT_SOURCE,
                    event_id = tracing::field::Empty,
                    principal = %request_context.principal,
                    client_id = %request_context.client_id,
                    #(#static_field_logs,)*
                    #(#optional_empty_fields,)*
                );

                if let Some(event_id) = ctx.event_id() {
                    span.record("event_id", tracing::field::display(event_id));
                }
                #(#optional_records)*

                span.in_scope(|| {
                    tracing::info!("{}", self.action());
                });
            }

            fn log_without_context(&self) {
                let span = tracing::info_span!(
                    #action,
                    event_source = AUDIT_LOG_EVENT_SOURCE,
                    #(#static_field_logs,)*
                    #(#optional_empty_fields,)*
                );

                #(#optional_records)*

                span.in_scope(|| {
                    tracing::info!("{}", self.action());
                });
            }
        }
    };

    TokenStream::from(expanded)
}

#[derive(Clone, Default)]
struct FieldAttrs {
    skip: bool,
    debug: bool,
    skip_none: bool,
}

fn parse_field_attrs(field: &syn::Field) -> FieldAttrs {
    let mut attrs = FieldAttrs::default();

    for attr in &field.attrs {
        if !attr.path().is_ident("audit") {
            continue;
        }

        let nested = attr
            .parse_args_with(
                syn::punctuated::Punctuated::<syn::Ident, syn::Token![,]>::parse_terminated,
            )
            .unwrap_or_else(|e| panic!("Malformed audit attribute: {e}"));
        for ident in nested {
            match ident.to_string().as_str() {
                "skip" => attrs.skip = true,
                "debug" => attrs.debug = true,
                "skip_none" => attrs.skip_none = true,
                other => panic!("Unknown audit attribute: {other}"),
            }
        }
    }

    attrs
}

fn generate_field_log(name: Option<&syn::Ident>, attrs: &FieldAttrs) -> proc_macro2::TokenStream {
    if attrs.debug {
        quote! { #name = ?self.#name }
    } else {
        quote! { #name = %self.#name }
    }
}

fn default_action_name(struct_name: &str) -> String {
    let snake = to_snake_case(struct_name);
    if let Some(stripped) = snake.strip_suffix("_record") {
        return stripped.to_string();
    }
    snake
}

fn to_snake_case(s: &str) -> String {
    let mut result = String::new();
    for (i, c) in s.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            result.push('_');
        }
        result.extend(c.to_lowercase());
    }
    result
}
