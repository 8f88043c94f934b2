//! Declarative field table for connection endpoints.
//!
//! `endpoint_schema!` takes one table of `(field / setter: type => "wireName" [= default])`
//! rows and generates from it:
//!
//! - the descriptor struct (every optional field stored as `Option<Input<T>>`),
//! - the all-optional `*Args` input struct used for construction,
//! - getters, setters and the `FIELDS` metadata table,
//! - default filling and the missing-`host` check.
//!
//! The wire names appear only in the table, so serialization and
//! deserialization can never disagree about them.

macro_rules! endpoint_schema {
    (@default $name:ident, $wire:literal, $value:expr, $default:expr) => {
        match $value {
            Some(value) => Some(value),
            None => {
                log::debug!("{}: `{}` unset, using default", stringify!($name), $wire);
                Some($crate::connection::Input::Value($default))
            }
        }
    };
    (@default $name:ident, $wire:literal, $value:expr) => {
        $value
    };
    (@has_default) => {
        false
    };
    (@has_default $default:expr) => {
        true
    };
    (
        $(#[$meta:meta])*
        pub struct $name:ident / $args:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident / $setter:ident: $ty:ty => $wire:literal $(= $default:expr)?,
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, serde::Serialize)]
        pub struct $name {
            host: $crate::connection::Input<String>,
            $(
                #[serde(rename = $wire, skip_serializing_if = "Option::is_none")]
                $field: Option<$crate::connection::Input<$ty>>,
            )*
        }

        /// Raw construction input. Every field is optional here, `host`
        /// included; [`build`](Self::build) enforces presence and fills defaults.
        #[derive(Debug, Clone, Default, PartialEq)]
        pub struct $args {
            pub host: Option<$crate::connection::Input<String>>,
            $(
                pub $field: Option<$crate::connection::Input<$ty>>,
            )*
        }

        impl<'de> serde::Deserialize<'de> for $args {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct ArgsVisitor;

                impl<'de> serde::de::Visitor<'de> for ArgsVisitor {
                    type Value = $args;

                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        f.write_str(concat!("a ", stringify!($name), " object"))
                    }

                    fn visit_map<A>(self, mut map: A) -> Result<$args, A::Error>
                    where
                        A: serde::de::MapAccess<'de>,
                    {
                        let mut args = $args::default();
                        while let Some(key) = map.next_key::<String>()? {
                            match key.as_str() {
                                "host" => {
                                    args.host = $crate::connection::field_value(&mut map, "host")?;
                                }
                                $(
                                    $wire => {
                                        args.$field = $crate::connection::field_value(&mut map, $wire)?;
                                    }
                                )*
                                _ => {
                                    map.next_value::<serde::de::IgnoredAny>()?;
                                }
                            }
                        }
                        Ok(args)
                    }
                }

                deserializer.deserialize_map(ArgsVisitor)
            }
        }

        impl $args {
            pub fn with_host(host: impl Into<$crate::connection::Input<String>>) -> Self {
                Self {
                    host: Some(host.into()),
                    ..Default::default()
                }
            }

            pub fn build(self) -> Result<$name, $crate::error::ConnectionError> {
                self.build_at("host")
            }

            /// Like [`build`](Self::build), but reports a missing host under
            /// `host_path` so nested descriptors can name their position.
            pub(crate) fn build_at(
                mut self,
                host_path: &'static str,
            ) -> Result<$name, $crate::error::ConnectionError> {
                let host = self.host.take().ok_or(
                    $crate::error::ConnectionError::MissingRequiredField { field: host_path },
                )?;
                Ok(self.assemble(host))
            }

            fn assemble(self, host: $crate::connection::Input<String>) -> $name {
                let Self { $($field,)* .. } = self;
                $name {
                    host,
                    $(
                        $field: endpoint_schema!(@default $name, $wire, $field $(, $default)?),
                    )*
                }
            }
        }

        impl TryFrom<$args> for $name {
            type Error = $crate::error::ConnectionError;

            fn try_from(args: $args) -> Result<Self, Self::Error> {
                args.build()
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let args = <$args as serde::Deserialize>::deserialize(deserializer)?;
                args.build().map_err(serde::de::Error::custom)
            }
        }

        impl $name {
            /// Field metadata in declaration order, `host` first.
            pub const FIELDS: &'static [$crate::connection::FieldSpec] = &[
                $crate::connection::FieldSpec {
                    name: "host",
                    wire_name: "host",
                    required: true,
                    has_default: false,
                },
                $(
                    $crate::connection::FieldSpec {
                        name: stringify!($field),
                        wire_name: $wire,
                        required: false,
                        has_default: endpoint_schema!(@has_default $($default)?),
                    },
                )*
            ];

            /// A descriptor for `host` with every default applied.
            pub fn new(host: impl Into<$crate::connection::Input<String>>) -> Self {
                $args::default().assemble(host.into())
            }

            /// The address of the machine to connect to.
            pub fn host(&self) -> &$crate::connection::Input<String> {
                &self.host
            }

            pub fn set_host(&mut self, host: impl Into<$crate::connection::Input<String>>) {
                self.host = host.into();
            }

            $(
                $(#[$field_meta])*
                pub fn $field(&self) -> Option<&$crate::connection::Input<$ty>> {
                    self.$field.as_ref()
                }

                pub fn $setter(&mut self, value: Option<$crate::connection::Input<$ty>>) {
                    self.$field = value;
                }
            )*

            /// True when neither `host` nor any optional field is deferred.
            pub fn is_fully_known(&self) -> bool {
                !self.host.is_deferred()
                    $(
                        && !self.$field.as_ref().is_some_and(|v| v.is_deferred())
                    )*
            }

            pub fn from_json(json: &str) -> Result<Self, $crate::error::ConnectionError> {
                let args: $args = serde_json::from_str(json)?;
                args.build()
            }

            pub fn from_value(value: serde_json::Value) -> Result<Self, $crate::error::ConnectionError> {
                let args: $args = serde_json::from_value(value)?;
                args.build()
            }

            pub fn to_json(&self) -> Result<String, $crate::error::ConnectionError> {
                Ok(serde_json::to_string(self)?)
            }

            pub fn to_value(&self) -> Result<serde_json::Value, $crate::error::ConnectionError> {
                Ok(serde_json::to_value(self)?)
            }
        }
    };
}
