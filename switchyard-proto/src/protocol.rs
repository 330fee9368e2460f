use crate::{AddressingError, Encoding, ProtocolConfig, ProtocolLayer, Translator};
use std::sync::Arc;
use tracing::info;

/// The immutable configuration shared by every connection of one kind: the
/// translator and the ordered layer chain.
#[derive(Debug)]
pub struct Protocol<S> {
    translator: Translator,
    layers: Vec<ProtocolLayer<S>>,
}

impl<S> Protocol<S> {
    pub fn builder(encoding: Encoding) -> ProtocolBuilder<S> {
        ProtocolBuilder {
            translator: Translator::new(encoding),
            layers: Vec::new(),
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn layers(&self) -> &[ProtocolLayer<S>] {
        &self.layers
    }
}

pub struct ProtocolBuilder<S> {
    translator: Translator,
    layers: Vec<ProtocolLayer<S>>,
}

impl<S> ProtocolBuilder<S> {
    /// Pre-registers every command of a declarative configuration.
    pub fn commands(mut self, config: &ProtocolConfig) -> Result<Self, AddressingError> {
        self.translator.load(config)?;
        Ok(self)
    }

    /// Appends a layer built against this protocol's translator. Layers are
    /// consulted in the order they are added.
    pub fn layer<F>(mut self, build: F) -> Result<Self, AddressingError>
    where
        F: FnOnce(&mut Translator) -> Result<ProtocolLayer<S>, AddressingError>,
    {
        let layer = build(&mut self.translator)?;
        self.layers.push(layer);
        Ok(self)
    }

    pub fn translator(&mut self) -> &mut Translator {
        &mut self.translator
    }

    pub fn build(self) -> Arc<Protocol<S>> {
        info!(
            "Protocol ready: {:?} encoding, {} namespaces, {} layers",
            self.translator.encoding(),
            self.translator.namespaces().count(),
            self.layers.len()
        );
        Arc::new(Protocol {
            translator: self.translator,
            layers: self.layers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandSpec, Direction, Outcome};

    #[test]
    fn test_layers_keep_their_order() {
        let protocol = Protocol::<()>::builder(Encoding::Text)
            .commands(&ProtocolConfig::new().command("chat", "said", Direction::ClientBound))
            .unwrap()
            .layer(|t| Ok(ProtocolLayer::builder("first", t).build()))
            .unwrap()
            .layer(|t| {
                Ok(ProtocolLayer::builder("second", t)
                    .on(CommandSpec::named("chat"), CommandSpec::named("say"), |_, _, _| {
                        Ok(Outcome::Handled)
                    })?
                    .build())
            })
            .unwrap()
            .build();

        let names: Vec<_> = protocol.layers().iter().map(ProtocolLayer::name).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(protocol.translator().namespaces().count(), 1);
    }

    #[test]
    fn test_layer_errors_surface() {
        let result = Protocol::<()>::builder(Encoding::Compact).layer(|t| {
            Ok(ProtocolLayer::builder("named", t)
                .on(CommandSpec::named("chat"), CommandSpec::named("say"), |_, _, _| {
                    Ok(Outcome::Handled)
                })?
                .build())
        });
        assert!(matches!(result, Err(AddressingError::MissingCode(_))));
    }
}
