//! # Command Catalog
//!
//! Every command a region can send to a rack controller, plus the two handshake
//! commands both sides answer. Field order matches the wire declaration.

use crate::error::{Error, ErrorKind, Result};
use crate::schema::{Command, CommandSpec, Field, FieldType};
use crate::value::Record;

use FieldType::*;

/// Declares marker types for commands and collects them into [`ALL`].
///
/// ```ignore
/// commands! {
///     /// Doc comment.
///     PowerOn {
///         arguments: POWER_ARGUMENTS,
///         response: &[],
///         errors: POWER_ERRORS,
///     }
/// }
/// ```
macro_rules! commands {
    ($(
        $(#[$meta:meta])*
        $ty:ident {
            arguments: $args:expr,
            response: $resp:expr,
            errors: $errs:expr $(,)?
        }
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default)]
            pub struct $ty;

            impl Command for $ty {
                const SPEC: &'static CommandSpec = &CommandSpec {
                    name: stringify!($ty),
                    arguments: $args,
                    response: $resp,
                    errors: $errs,
                };
            }
        )*

        /// Every command in the catalog, in declaration order.
        pub const ALL: &[&CommandSpec] = &[$(<$ty as Command>::SPEC),*];
    };
}

/// Finds a command by its wire name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    ALL.iter().copied().find(|spec| spec.name == name)
}

const NONE: &[Field] = &[];

const BOOT_IMAGE: &[Field] = &[
    Field::required("osystem", Unicode),
    Field::required("architecture", Unicode),
    Field::required("subarchitecture", Unicode),
    Field::required("release", Unicode),
    Field::required("label", Unicode),
    Field::required("purpose", Unicode),
    Field::required("xinstall_type", Unicode),
    Field::required("xinstall_path", Unicode),
];

const OS_RELEASE: &[Field] = &[
    Field::required("name", Unicode),
    Field::required("title", Unicode),
    Field::required("requires_license_key", Boolean),
    Field::required("can_commission", Boolean),
];

const OPERATING_SYSTEM: &[Field] = &[
    Field::required("name", Unicode),
    Field::required("title", Unicode),
    Field::required("releases", List(OS_RELEASE)),
    Field::optional("default_release", Unicode),
    Field::optional("default_commissioning_release", Unicode),
];

const POWER_ARGUMENTS: &[Field] = &[
    Field::required("system_id", Unicode),
    Field::required("hostname", Unicode),
    Field::required("power_type", Unicode),
    Field::required("context", Json),
];

const POWER_ERRORS: &[ErrorKind] = &[
    ErrorKind::UnknownPowerType,
    ErrorKind::NotImplemented,
    ErrorKind::PowerActionFail,
    ErrorKind::PowerActionAlreadyInProgress,
];

const DHCP_HOST: &[Field] = &[
    Field::required("host", Unicode),
    Field::required("mac", Unicode),
    Field::required("ip", Unicode),
];

const DHCP_SUBNET: &[Field] = &[
    Field::required("subnet", Unicode),
    Field::required("subnet_mask", Unicode),
    Field::required("subnet_cidr", Unicode),
    Field::required("broadcast_ip", Unicode),
    Field::required("interface", Unicode),
    Field::required("router_ip", Unicode),
    Field::required("dns_servers", Unicode),
    Field::required("ntp_server", Unicode),
    Field::required("domain_name", Unicode),
    Field::required("ip_range_low", Unicode),
    Field::required("ip_range_high", Unicode),
    Field::optional("hosts", CompressedList(DHCP_HOST)),
];

const DHCP_ARGUMENTS: &[Field] = &[
    Field::required("omapi_key", Unicode),
    Field::required("subnet_configs", List(DHCP_SUBNET)),
];

const BOOT_SOURCE_SELECTION: &[Field] = &[
    Field::required("os", Unicode),
    Field::required("release", Unicode),
    Field::required("arches", ListOf(&Unicode)),
    Field::required("subarches", ListOf(&Unicode)),
    Field::required("labels", ListOf(&Unicode)),
];

const BOOT_SOURCE: &[Field] = &[
    Field::required("url", Unicode),
    Field::required("keyring_data", Bytes),
    Field::required("selections", List(BOOT_SOURCE_SELECTION)),
];

commands! {
    /// Asks the remote for its event-loop identity (or system id).
    Identify {
        arguments: NONE,
        response: &[Field::required("ident", Unicode)],
        errors: &[],
    }

    /// Challenges the remote to prove it holds the shared secret.
    Authenticate {
        arguments: &[Field::required("message", Bytes)],
        response: &[
            Field::required("digest", Bytes),
            Field::required("salt", Bytes),
        ],
        errors: &[],
    }

    /// Lists boot images. Large catalogues overflow the value cap; prefer V2.
    ListBootImages {
        arguments: NONE,
        response: &[Field::required("images", List(BOOT_IMAGE))],
        errors: &[],
    }

    /// Lists boot images, shipping the list compressed.
    ListBootImagesV2 {
        arguments: NONE,
        response: &[Field::required("images", CompressedList(BOOT_IMAGE))],
        errors: &[],
    }

    DescribePowerTypes {
        arguments: NONE,
        response: &[Field::required("power_types", Json)],
        errors: &[],
    }

    ListSupportedArchitectures {
        arguments: NONE,
        response: &[Field::required(
            "architectures",
            List(&[
                Field::required("name", Unicode),
                Field::required("description", Unicode),
            ]),
        )],
        errors: &[],
    }

    ListOperatingSystems {
        arguments: NONE,
        response: &[Field::required("osystems", List(OPERATING_SYSTEM))],
        errors: &[],
    }

    GetOSReleaseTitle {
        arguments: &[
            Field::required("osystem", Unicode),
            Field::required("release", Unicode),
        ],
        response: &[Field::required("title", Unicode)],
        errors: &[ErrorKind::NoSuchOperatingSystem],
    }

    ValidateLicenseKey {
        arguments: &[
            Field::required("osystem", Unicode),
            Field::required("release", Unicode),
            Field::required("key", Unicode),
        ],
        response: &[Field::required("is_valid", Boolean)],
        errors: &[ErrorKind::NoSuchOperatingSystem],
    }

    /// Reports packages a power driver is missing.
    PowerDriverCheck {
        arguments: &[Field::required("power_type", Unicode)],
        response: &[Field::required("missing_packages", ListOf(&Unicode))],
        errors: &[ErrorKind::UnknownPowerType, ErrorKind::NotImplemented],
    }

    GetPreseedData {
        arguments: &[
            Field::required("osystem", Unicode),
            Field::required("preseed_type", Unicode),
            Field::required("node_system_id", Unicode),
            Field::required("node_hostname", Unicode),
            Field::required("consumer_key", Unicode),
            Field::required("token_key", Unicode),
            Field::required("token_secret", Unicode),
            Field::required("metadata_url", Url),
        ],
        response: &[Field::required("data", Json)],
        errors: &[ErrorKind::NoSuchOperatingSystem, ErrorKind::NotImplemented],
    }

    PowerOn {
        arguments: POWER_ARGUMENTS,
        response: NONE,
        errors: POWER_ERRORS,
    }

    PowerOff {
        arguments: POWER_ARGUMENTS,
        response: NONE,
        errors: POWER_ERRORS,
    }

    PowerQuery {
        arguments: POWER_ARGUMENTS,
        response: &[Field::required("state", Unicode)],
        errors: POWER_ERRORS,
    }

    ConfigureDHCPv4 {
        arguments: DHCP_ARGUMENTS,
        response: NONE,
        errors: &[ErrorKind::CannotConfigureDhcp],
    }

    ConfigureDHCPv6 {
        arguments: DHCP_ARGUMENTS,
        response: NONE,
        errors: &[ErrorKind::CannotConfigureDhcp],
    }

    RemoveHostMaps {
        arguments: &[
            Field::required("ip_addresses", ListOf(&Unicode)),
            Field::required("shared_key", Unicode),
        ],
        response: NONE,
        errors: &[ErrorKind::CannotRemoveHostMap],
    }

    ImportBootImages {
        arguments: &[
            Field::required("sources", List(BOOT_SOURCE)),
            Field::optional("http_proxy", Url),
            Field::optional("https_proxy", Url),
        ],
        response: NONE,
        errors: &[],
    }

    EvaluateTag {
        arguments: &[
            Field::required("tag_name", Unicode),
            Field::required("tag_definition", Unicode),
            Field::required(
                "tag_nsmap",
                List(&[
                    Field::required("prefix", Unicode),
                    Field::required("uri", Unicode),
                ]),
            ),
            Field::required("credentials", Unicode),
            Field::required("nodes", List(&[Field::required("system_id", Unicode)])),
        ],
        response: NONE,
        errors: &[],
    }

    AddVirsh {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("poweraddr", Unicode),
            Field::optional("password", Unicode),
            Field::optional("prefix_filter", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[],
    }

    AddSeaMicro15k {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("mac", Unicode),
            Field::required("username", Unicode),
            Field::required("password", Unicode),
            Field::optional("power_control", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[ErrorKind::NoIpFoundForMacAddress],
    }

    AddVMware {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("host", Unicode),
            Field::required("username", Unicode),
            Field::required("password", Unicode),
            Field::optional("port", Integer),
            Field::optional("protocol", Unicode),
            Field::optional("prefix_filter", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[],
    }

    EnlistNodesFromMSCM {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("host", Unicode),
            Field::required("username", Unicode),
            Field::required("password", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[],
    }

    EnlistNodesFromUCSM {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("url", Unicode),
            Field::required("username", Unicode),
            Field::required("password", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[],
    }

    EnlistNodesFromMicrosoftOCS {
        arguments: &[
            Field::required("user", Unicode),
            Field::required("ip", Unicode),
            Field::required("port", Unicode),
            Field::required("username", Unicode),
            Field::required("password", Unicode),
            Field::optional("accept_all", Boolean),
        ],
        response: NONE,
        errors: &[],
    }

    IsImportBootImagesRunning {
        arguments: NONE,
        response: &[Field::required("running", Boolean)],
        errors: &[],
    }

    /// Asks a rack controller to report its hardware and network details.
    RefreshRackControllerInfo {
        arguments: &[
            Field::required("system_id", Unicode),
            Field::required("consumer_key", Unicode),
            Field::required("token_key", Unicode),
            Field::required("token_secret", Unicode),
        ],
        response: &[
            Field::required("architecture", Unicode),
            Field::required("osystem", Unicode),
            Field::required("distro_series", Unicode),
            Field::required("swap_size", Integer),
        ],
        errors: &[],
    }
}

/// One entry of the `images` list returned by `ListBootImages*`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootImage {
    pub osystem: String,
    pub architecture: String,
    pub subarchitecture: String,
    pub release: String,
    pub label: String,
    pub purpose: String,
    pub xinstall_type: String,
    pub xinstall_path: String,
}

impl From<&BootImage> for Record {
    fn from(image: &BootImage) -> Self {
        Record::new()
            .with("osystem", image.osystem.as_str())
            .with("architecture", image.architecture.as_str())
            .with("subarchitecture", image.subarchitecture.as_str())
            .with("release", image.release.as_str())
            .with("label", image.label.as_str())
            .with("purpose", image.purpose.as_str())
            .with("xinstall_type", image.xinstall_type.as_str())
            .with("xinstall_path", image.xinstall_path.as_str())
    }
}

impl TryFrom<&Record> for BootImage {
    type Error = Error;

    fn try_from(record: &Record) -> Result<Self> {
        Ok(BootImage {
            osystem: record.unicode("osystem")?.to_owned(),
            architecture: record.unicode("architecture")?.to_owned(),
            subarchitecture: record.unicode("subarchitecture")?.to_owned(),
            release: record.unicode("release")?.to_owned(),
            label: record.unicode("label")?.to_owned(),
            purpose: record.unicode("purpose")?.to_owned(),
            xinstall_type: record.unicode("xinstall_type")?.to_owned(),
            xinstall_path: record.unicode("xinstall_path")?.to_owned(),
        })
    }
}

impl BootImage {
    /// Builds the response record for either `ListBootImages` variant.
    pub fn to_response(images: &[BootImage]) -> Record {
        Record::new().with("images", images.iter().map(Record::from).collect::<Vec<_>>())
    }

    /// Reads the `images` field of a `ListBootImages*` response.
    pub fn from_response(response: &Record) -> Result<Vec<BootImage>> {
        response.list("images")?.iter().map(BootImage::try_from).collect()
    }
}
