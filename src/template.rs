//! Rendering of network plugin configuration templates.
//!
//! Templates are plain text with `{{ PodCIDR }}`, `{{ NodePodCIDR }}` and
//! `{{ MTU }}` bindings. A leading dot on a binding (`{{ .PodCIDR }}`) is
//! accepted and normalised away so existing template files keep working.
//! Referencing anything undefined is an error rather than silently
//! rendering empty output into a live CNI config.

use minijinja::{context, Environment, UndefinedBehavior};
use thiserror::Error;

/// Values substituted into plugin-config templates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bindings {
    /// The cluster-wide pod network
    pub pod_cidr: String,
    /// This node's pod network
    pub node_pod_cidr: String,
    /// MTU of the WireGuard link
    pub mtu: u32,
}

/// A template failed to parse or render.
#[derive(Debug, Error)]
#[error("template '{name}' failed to render: {source}")]
pub struct TemplateError {
    /// The template's file name
    pub name: String,
    /// Underlying engine error
    #[source]
    pub source: minijinja::Error,
}

/// Render one template with the given bindings.
pub fn render(name: &str, source: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    let normalised = normalise(source);

    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    let render_err = |source| TemplateError {
        name: name.to_owned(),
        source,
    };

    env.add_template(name, &normalised).map_err(render_err)?;
    let template = env.get_template(name).map_err(render_err)?;

    template
        .render(context! {
            PodCIDR => bindings.pod_cidr.as_str(),
            NodePodCIDR => bindings.node_pod_cidr.as_str(),
            MTU => bindings.mtu,
        })
        .map_err(render_err)
}

// Strip the dot in `{{ .Name }}` so dotted and plain spellings render the
// same. Only a dot directly opening an expression is touched.
fn normalise(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;

    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos + 2]);
        rest = &rest[pos + 2..];

        let after_ws = rest.trim_start();
        if let Some(stripped) = after_ws.strip_prefix('.') {
            out.push_str(&rest[..rest.len() - after_ws.len()]);
            rest = stripped;
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        Bindings {
            pod_cidr: "10.244.0.0/16".to_owned(),
            node_pod_cidr: "10.244.1.0/24".to_owned(),
            mtu: 1420,
        }
    }

    #[test]
    fn renders_every_binding() {
        let rendered = render(
            "10-wgkube.conflist",
            r#"{"podCIDR": "{{ PodCIDR }}", "subnet": "{{ NodePodCIDR }}", "mtu": {{ MTU }}}"#,
            &bindings(),
        )
        .unwrap();

        assert_eq!(
            rendered,
            r#"{"podCIDR": "10.244.0.0/16", "subnet": "10.244.1.0/24", "mtu": 1420}"#
        );
    }

    #[test]
    fn dotted_bindings_render_the_same() {
        let plain = render("t", "Foo {{ PodCIDR }} Bar", &bindings()).unwrap();
        let dotted = render("t", "Foo {{ .PodCIDR }} Bar", &bindings()).unwrap();
        assert_eq!(plain, dotted);
        assert_eq!(plain, "Foo 10.244.0.0/16 Bar");
    }

    #[test]
    fn dots_outside_expression_openings_are_untouched() {
        let rendered = render("t", "{{ MTU }}.conf", &bindings()).unwrap();
        assert_eq!(rendered, "1420.conf");
    }

    #[test]
    fn undefined_binding_is_an_error() {
        let err = render("t", "Foo {{ BROKEN_SHOULD_NOT_WORK }} Bar", &bindings()).unwrap_err();
        assert!(err.to_string().contains('t'));
    }

    #[test]
    fn broken_syntax_is_an_error() {
        assert!(render("t", "Foo {{ PodCIDR", &bindings()).is_err());
    }

    #[test]
    fn template_free_content_passes_through() {
        let source = "no bindings here";
        assert_eq!(render("t", source, &bindings()).unwrap(), source);
    }
}
