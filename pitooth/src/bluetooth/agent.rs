/*!
 * Pairing Agent
 * Headless org.bluez.Agent1 that consents to every prompt
 */

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dbus::channel::{MatchingReceiver, Token};
use dbus::message::MatchRule;
use dbus::nonblock::{Proxy, SyncConnection};
use dbus::Path;
use dbus_crossroads::{Crossroads, IfaceBuilder};
use tracing::{debug, info, warn, Dispatch};
use uuid::Uuid;

use super::{AGENT_INTERFACE, AGENT_MANAGER_INTERFACE, BLUEZ_ROOT_PATH, BLUEZ_SERVICE, BUS_TIMEOUT};
use crate::error::{Error, Result};

pub const AGENT_PATH: &str = "/org/pitooth/agent";
pub const AGENT_CAPABILITY: &str = "NoInputNoOutput";

// One exposed agent per process lifetime.
static AGENT_EXPOSED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Unregistered,
    Registered,
    /// Terminal until the process restarts.
    Released,
}

/// A prompt raised by the controller during pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    RequestPinCode { device: String },
    RequestPasskey { device: String },
    DisplayPinCode { device: String, code: String },
    DisplayPasskey { device: String, passkey: u32, entered: u16 },
    RequestConfirmation { device: String, passkey: u32 },
    RequestAuthorization { device: String },
    AuthorizeService { device: String, uuid: String },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::RequestPinCode { device } => write!(f, "RequestPinCode({})", device),
            Prompt::RequestPasskey { device } => write!(f, "RequestPasskey({})", device),
            Prompt::DisplayPinCode { device, code } => {
                write!(f, "DisplayPinCode({}, {})", device, code)
            }
            Prompt::DisplayPasskey { device, passkey, entered } => {
                write!(f, "DisplayPasskey({}, {:06}, entered {})", device, passkey, entered)
            }
            Prompt::RequestConfirmation { device, passkey } => {
                write!(f, "RequestConfirmation({}, {:06})", device, passkey)
            }
            Prompt::RequestAuthorization { device } => {
                write!(f, "RequestAuthorization({})", device)
            }
            Prompt::AuthorizeService { device, uuid } => match service_name(uuid) {
                Some(name) => write!(f, "AuthorizeService({}, {} [{}])", device, uuid, name),
                None => write!(f, "AuthorizeService({}, {})", device, uuid),
            },
        }
    }
}

/// Cheaply cloneable; the bus dispatcher and the manager share one agent.
#[derive(Clone)]
pub struct PairingAgent {
    inner: Arc<Mutex<AgentInner>>,
    logger: Dispatch,
}

struct AgentInner {
    state: AgentState,
    // Most recently answered prompt; cleared by the controller's Cancel.
    last_prompt: Option<Prompt>,
    answered: u64,
    preset_pin_code: Option<String>,
    preset_passkey: Option<u32>,
    routing: Option<(Arc<SyncConnection>, Token)>,
}

impl PairingAgent {
    pub fn new(logger: Dispatch) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AgentInner {
                state: AgentState::Unregistered,
                last_prompt: None,
                answered: 0,
                preset_pin_code: None,
                preset_passkey: None,
                routing: None,
            })),
            logger,
        }
    }

    /// Exposes the agent on `conn`, registers it with BlueZ and makes it the default agent.
    pub async fn register(conn: Arc<SyncConnection>, logger: Dispatch) -> Result<Self> {
        if AGENT_EXPOSED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AgentRegistration(
                "a pairing agent is already exposed by this process".to_string(),
            ));
        }

        let agent = Self::new(logger);
        if let Err(e) = agent.expose(conn).await {
            AGENT_EXPOSED.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(agent)
    }

    async fn expose(&self, conn: Arc<SyncConnection>) -> Result<()> {
        let cr = Mutex::new(self.crossroads());
        let token = conn.start_receive(
            MatchRule::new_method_call().with_path(AGENT_PATH),
            Box::new(move |msg, conn| {
                let mut cr = cr.lock().unwrap_or_else(PoisonError::into_inner);
                if cr.handle_message(msg, conn).is_err() {
                    warn!("Agent could not handle an incoming method call");
                }
                true
            }),
        );

        let manager = agent_manager(&conn);
        if let Err(e) = manager
            .method_call::<(), _, _, _>(
                AGENT_MANAGER_INTERFACE,
                "RegisterAgent",
                (Path::from(AGENT_PATH), AGENT_CAPABILITY),
            )
            .await
        {
            conn.stop_receive(token);
            return Err(Error::AgentRegistration(format!("RegisterAgent: {}", e)));
        }

        if let Err(e) = manager
            .method_call::<(), _, _, _>(
                AGENT_MANAGER_INTERFACE,
                "RequestDefaultAgent",
                (Path::from(AGENT_PATH),),
            )
            .await
        {
            let _ = manager
                .method_call::<(), _, _, _>(
                    AGENT_MANAGER_INTERFACE,
                    "UnregisterAgent",
                    (Path::from(AGENT_PATH),),
                )
                .await;
            conn.stop_receive(token);
            return Err(Error::AgentRegistration(format!("RequestDefaultAgent: {}", e)));
        }

        let mut inner = self.inner();
        inner.routing = Some((conn, token));
        inner.state = AgentState::Registered;
        drop(inner);

        self.log(|| info!("Pairing agent registered at {} ({})", AGENT_PATH, AGENT_CAPABILITY));
        Ok(())
    }

    /// Unregisters from BlueZ and stops routing bus calls here. The agent ends `Released`.
    pub async fn unregister(&self) -> Result<()> {
        let routing = {
            let mut inner = self.inner();
            inner.state = AgentState::Released;
            inner.routing.take()
        };
        let Some((conn, token)) = routing else {
            return Ok(());
        };

        let result = agent_manager(&conn)
            .method_call::<(), _, _, _>(
                AGENT_MANAGER_INTERFACE,
                "UnregisterAgent",
                (Path::from(AGENT_PATH),),
            )
            .await;
        conn.stop_receive(token);
        self.log(|| info!("Pairing agent released"));

        result.map_err(|e| Error::AgentRegistration(format!("UnregisterAgent: {}", e)))
    }

    pub fn state(&self) -> AgentState {
        self.inner().state
    }

    pub fn answered(&self) -> u64 {
        self.inner().answered
    }

    pub fn last_prompt(&self) -> Option<Prompt> {
        self.inner().last_prompt.clone()
    }

    /// Recorded for logs only; replies stay empty / zero.
    pub fn set_preset_pin_code(&self, code: impl Into<String>) {
        self.inner().preset_pin_code = Some(code.into());
    }

    /// Recorded for logs only; replies stay empty / zero.
    pub fn set_preset_passkey(&self, passkey: u32) {
        self.inner().preset_passkey = Some(passkey);
    }

    pub fn request_pin_code(&self, device: &str) -> String {
        let preset = self.inner().preset_pin_code.clone();
        self.answer(Prompt::RequestPinCode { device: device.to_string() }, || {
            debug!("Answering with an empty PIN code (preset {:?} not used)", preset)
        });
        String::new()
    }

    pub fn request_passkey(&self, device: &str) -> u32 {
        let preset = self.inner().preset_passkey;
        self.answer(Prompt::RequestPasskey { device: device.to_string() }, || {
            debug!("Answering with passkey 0 (preset {:?} not used)", preset)
        });
        0
    }

    pub fn display_pin_code(&self, device: &str, code: &str) {
        self.answer(
            Prompt::DisplayPinCode { device: device.to_string(), code: code.to_string() },
            || debug!("No display; PIN code ignored"),
        );
    }

    pub fn display_passkey(&self, device: &str, passkey: u32, entered: u16) {
        self.answer(
            Prompt::DisplayPasskey { device: device.to_string(), passkey, entered },
            || debug!("No display; passkey ignored"),
        );
    }

    pub fn request_confirmation(&self, device: &str, passkey: u32) {
        self.answer(
            Prompt::RequestConfirmation { device: device.to_string(), passkey },
            || debug!("Auto-confirming"),
        );
    }

    pub fn request_authorization(&self, device: &str) {
        self.answer(
            Prompt::RequestAuthorization { device: device.to_string() },
            || debug!("Auto-authorizing pairing"),
        );
    }

    pub fn authorize_service(&self, device: &str, uuid: &str) {
        self.answer(
            Prompt::AuthorizeService { device: device.to_string(), uuid: uuid.to_string() },
            || debug!("Auto-authorizing service"),
        );
    }

    /// The controller abandoned the pairing attempt. Stays `Registered`.
    pub fn cancel(&self) {
        let last = self.inner().last_prompt.take();
        self.log(|| match last {
            Some(prompt) => info!("Pairing cancelled by controller (last answered: {})", prompt),
            None => info!("Pairing cancelled by controller"),
        });
    }

    /// BlueZ dropped the agent (daemon exit or unregistration).
    pub fn release(&self) {
        let mut inner = self.inner();
        inner.state = AgentState::Released;
        inner.last_prompt = None;
        drop(inner);
        self.log(|| info!("Pairing agent released by controller"));
    }

    fn answer(&self, prompt: Prompt, detail: impl FnOnce()) {
        {
            let mut inner = self.inner();
            inner.answered += 1;
            inner.last_prompt = Some(prompt.clone());
        }
        self.log(|| {
            debug!("Agent prompt: {}", prompt);
            detail();
        });
    }

    fn log(&self, f: impl FnOnce()) {
        tracing::dispatcher::with_default(&self.logger, f)
    }

    fn inner(&self) -> MutexGuard<'_, AgentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Object tree serving org.bluez.Agent1 at `AGENT_PATH`, backed by this agent.
    pub(crate) fn crossroads(&self) -> Crossroads {
        let mut cr = Crossroads::new();
        let iface = cr.register(AGENT_INTERFACE, |b: &mut IfaceBuilder<PairingAgent>| {
            b.method("Release", (), (), |_, agent, _: ()| {
                agent.release();
                Ok(())
            });
            b.method(
                "RequestPinCode",
                ("device",),
                ("pincode",),
                |_, agent, (device,): (Path<'static>,)| Ok((agent.request_pin_code(&device),)),
            );
            b.method(
                "DisplayPinCode",
                ("device", "pincode"),
                (),
                |_, agent, (device, code): (Path<'static>, String)| {
                    agent.display_pin_code(&device, &code);
                    Ok(())
                },
            );
            b.method(
                "RequestPasskey",
                ("device",),
                ("passkey",),
                |_, agent, (device,): (Path<'static>,)| Ok((agent.request_passkey(&device),)),
            );
            b.method(
                "DisplayPasskey",
                ("device", "passkey", "entered"),
                (),
                |_, agent, (device, passkey, entered): (Path<'static>, u32, u16)| {
                    agent.display_passkey(&device, passkey, entered);
                    Ok(())
                },
            );
            b.method(
                "RequestConfirmation",
                ("device", "passkey"),
                (),
                |_, agent, (device, passkey): (Path<'static>, u32)| {
                    agent.request_confirmation(&device, passkey);
                    Ok(())
                },
            );
            b.method(
                "RequestAuthorization",
                ("device",),
                (),
                |_, agent, (device,): (Path<'static>,)| {
                    agent.request_authorization(&device);
                    Ok(())
                },
            );
            b.method(
                "AuthorizeService",
                ("device", "uuid"),
                (),
                |_, agent, (device, uuid): (Path<'static>, String)| {
                    agent.authorize_service(&device, &uuid);
                    Ok(())
                },
            );
            b.method("Cancel", (), (), |_, agent, _: ()| {
                agent.cancel();
                Ok(())
            });
        });
        cr.insert(AGENT_PATH, &[iface], self.clone());
        cr
    }

    #[cfg(test)]
    pub(crate) fn mark_registered(&self) {
        self.inner().state = AgentState::Registered;
    }
}

impl fmt::Debug for PairingAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner();
        f.debug_struct("PairingAgent")
            .field("state", &inner.state)
            .field("answered", &inner.answered)
            .finish_non_exhaustive()
    }
}

fn agent_manager(conn: &Arc<SyncConnection>) -> Proxy<'static, Arc<SyncConnection>> {
    Proxy::new(BLUEZ_SERVICE, BLUEZ_ROOT_PATH, BUS_TIMEOUT, conn.clone())
}

/// Profile name for well-known 16-bit service UUIDs.
pub fn service_name(uuid: &str) -> Option<&'static str> {
    let parsed = Uuid::parse_str(uuid).ok()?;
    let (short, d2, d3, d4) = parsed.as_fields();
    if d2 != 0 || d3 != 0x1000 || d4 != &[0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb] {
        return None;
    }
    match short {
        0x1101 => Some("Serial Port"),
        0x1105 => Some("OBEX Object Push"),
        0x1106 => Some("OBEX File Transfer"),
        0x1108 => Some("Headset"),
        0x110a => Some("Audio Source"),
        0x110b => Some("Audio Sink"),
        0x110e => Some("A/V Remote Control"),
        0x111e => Some("Handsfree"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::message::MessageType;
    use dbus::Message;
    use std::cell::RefCell;

    const DEVICE: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";

    fn agent() -> PairingAgent {
        let agent = PairingAgent::new(Dispatch::none());
        agent.mark_registered();
        agent
    }

    fn call(cr: &mut Crossroads, member: &str, build: impl FnOnce(Message) -> Message) -> Message {
        let msg = Message::new_method_call("org.pitooth.test", AGENT_PATH, AGENT_INTERFACE, member)
            .unwrap();
        let mut msg = build(msg);
        msg.set_serial(7);

        let sent = RefCell::new(Vec::new());
        cr.handle_message(msg, &sent).unwrap();
        sent.into_inner().pop().expect("agent sent no reply")
    }

    #[test]
    fn direct_prompts_return_fixed_answers() {
        let agent = agent();
        assert_eq!(agent.request_pin_code(DEVICE), "");
        assert_eq!(agent.request_passkey(DEVICE), 0);
        agent.display_pin_code(DEVICE, "1234");
        agent.display_passkey(DEVICE, 123456, 3);
        agent.request_confirmation(DEVICE, 123456);
        agent.request_authorization(DEVICE);
        agent.authorize_service(DEVICE, "00001105-0000-1000-8000-00805f9b34fb");

        assert_eq!(agent.answered(), 7);
        assert_eq!(agent.state(), AgentState::Registered);
    }

    #[test]
    fn presets_do_not_change_replies() {
        let agent = agent();
        agent.set_preset_pin_code("0000");
        agent.set_preset_passkey(424242);
        assert_eq!(agent.request_pin_code(DEVICE), "");
        assert_eq!(agent.request_passkey(DEVICE), 0);
    }

    #[test]
    fn bus_prompts_reply_per_contract() {
        let agent = agent();
        let mut cr = agent.crossroads();
        let dev = || Path::from(DEVICE);

        let reply = call(&mut cr, "RequestPinCode", |m| m.append1(dev()));
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.read1::<&str>().unwrap(), "");

        let reply = call(&mut cr, "RequestPasskey", |m| m.append1(dev()));
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.read1::<u32>().unwrap(), 0);

        let unit_replies = [
            call(&mut cr, "DisplayPinCode", |m| m.append2(dev(), "1234")),
            call(&mut cr, "DisplayPasskey", |m| m.append3(dev(), 123456u32, 2u16)),
            call(&mut cr, "RequestConfirmation", |m| m.append2(dev(), 123456u32)),
            call(&mut cr, "RequestAuthorization", |m| m.append1(dev())),
            call(&mut cr, "AuthorizeService", |m| {
                m.append2(dev(), "00001106-0000-1000-8000-00805f9b34fb")
            }),
            call(&mut cr, "Cancel", |m| m),
        ];
        for reply in &unit_replies {
            assert_eq!(reply.msg_type(), MessageType::MethodReturn);
            assert!(reply.get_items().is_empty());
        }

        assert_eq!(agent.answered(), 7);
        assert_eq!(agent.state(), AgentState::Registered);
    }

    #[test]
    fn cancel_clears_last_prompt_but_stays_registered() {
        let agent = agent();
        assert_eq!(agent.last_prompt(), None);
        agent.request_confirmation(DEVICE, 1);
        assert!(matches!(agent.last_prompt(), Some(Prompt::RequestConfirmation { .. })));

        agent.cancel();
        assert_eq!(agent.last_prompt(), None);
        assert_eq!(agent.state(), AgentState::Registered);
    }

    #[test]
    fn release_over_the_bus_is_terminal() {
        let agent = agent();
        let mut cr = agent.crossroads();
        let reply = call(&mut cr, "Release", |m| m);
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(agent.state(), AgentState::Released);

        // prompts are still answered, the state does not move
        assert_eq!(agent.request_passkey(DEVICE), 0);
        assert_eq!(agent.state(), AgentState::Released);
    }

    #[test]
    fn names_well_known_services() {
        assert_eq!(
            service_name("00001105-0000-1000-8000-00805f9b34fb"),
            Some("OBEX Object Push")
        );
        assert_eq!(
            service_name("0000111E-0000-1000-8000-00805F9B34FB"),
            Some("Handsfree")
        );
        assert_eq!(service_name("00001105-0000-1000-8000-000000000000"), None);
        assert_eq!(service_name("not-a-uuid"), None);
    }

    #[test]
    fn prompt_display_includes_service_name() {
        let prompt = Prompt::AuthorizeService {
            device: DEVICE.to_string(),
            uuid: "00001106-0000-1000-8000-00805f9b34fb".to_string(),
        };
        assert!(prompt.to_string().contains("OBEX File Transfer"));
    }
}
