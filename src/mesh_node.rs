// BLE mesh node: composition, provisioning and the vendor/generic model callbacks
// Callbacks run on the mesh stack's task and hand every event to the installed sink

use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_sys::{self as sys, esp, EspError};

use log::{debug, error, info, warn};

use std::ffi::CString;
use std::sync::OnceLock;

use crate::gateway::MeshEvent;
use crate::links::{LinkError, MeshLink, MessageContext};
use crate::mesh_protocol::{
    CID_ESP, MQTT_CONFIG_MODEL_ID, MQTT_CONFIG_OP_SEND, WIFI_CONFIG_MODEL_ID, WIFI_CONFIG_OP_SEND,
};

const MODEL_ID_CONFIG_SERVER: u16 = 0x0000;
const MODEL_ID_GEN_ONOFF_CLIENT: u16 = 0x1001;
const KEY_UNUSED: u16 = 0xFFFF;
const DEFAULT_TTL: u8 = 7;
const SEND_TTL_DEFAULT: u8 = 0xFF;
// Shortest vendor message the stack hands to the callback
const VENDOR_OP_MIN_LEN: usize = 2;

type MeshSink = Box<dyn Fn(MeshEvent) + Send + Sync>;

static MESH_SINK: OnceLock<MeshSink> = OnceLock::new();

/// Route mesh callbacks to `sink`. Only the first installed sink is used.
pub fn install_sink(sink: impl Fn(MeshEvent) + Send + Sync + 'static) {
    if MESH_SINK.set(Box::new(sink)).is_err() {
        warn!("⚠️ Mesh event sink already installed");
    }
}

fn dispatch(event: MeshEvent) {
    match MESH_SINK.get() {
        Some(sink) => sink(event),
        None => warn!("⚠️ Mesh event dropped, no sink installed: {:?}", event),
    }
}

// Model tables handed to the mesh stack; must stay at a fixed address for the node's lifetime
struct Composition {
    uuid: [u8; 16],
    config_server: sys::esp_ble_mesh_cfg_srv_t,
    onoff_client: sys::esp_ble_mesh_client_t,
    wifi_ops: [sys::esp_ble_mesh_model_op_t; 2],
    mqtt_ops: [sys::esp_ble_mesh_model_op_t; 2],
    root_models: [sys::esp_ble_mesh_model_t; 2],
    vendor_models: [sys::esp_ble_mesh_model_t; 2],
    elements: [sys::esp_ble_mesh_elem_t; 1],
    comp: sys::esp_ble_mesh_comp_t,
    prov: sys::esp_ble_mesh_prov_t,
}

impl Composition {
    fn leak() -> &'static mut Self {
        // SAFETY: every member is a plain C struct for which all-zero is the
        // static initializer the mesh headers expect
        let comp: Box<Self> = Box::new(unsafe { core::mem::zeroed() });
        let comp = Box::leak(comp);

        // First two bytes let a provisioner match this device
        comp.uuid[0] = 0xdd;
        comp.uuid[1] = 0xdd;
        // SAFETY: the controller is enabled, so the address pointer is valid
        let address = unsafe { sys::esp_bt_dev_get_address() };
        if !address.is_null() {
            let address = unsafe { std::slice::from_raw_parts(address, 6) };
            comp.uuid[2..8].copy_from_slice(address);
        }

        comp.config_server.relay = sys::ESP_BLE_MESH_RELAY_DISABLED as u8;
        comp.config_server.beacon = sys::ESP_BLE_MESH_BEACON_ENABLED as u8;
        comp.config_server.friend_state = sys::ESP_BLE_MESH_FRIEND_NOT_SUPPORTED as u8;
        comp.config_server.gatt_proxy = sys::ESP_BLE_MESH_GATT_PROXY_ENABLED as u8;
        comp.config_server.default_ttl = DEFAULT_TTL;
        comp.config_server.net_transmit = transmit(2, 20);
        comp.config_server.relay_retransmit = transmit(2, 20);

        comp.wifi_ops[0] = vendor_op(WIFI_CONFIG_OP_SEND);
        comp.mqtt_ops[0] = vendor_op(MQTT_CONFIG_OP_SEND);

        sig_model(
            &mut comp.root_models[0],
            MODEL_ID_CONFIG_SERVER,
            &mut comp.config_server as *mut _ as *mut core::ffi::c_void,
        );
        sig_model(
            &mut comp.root_models[1],
            MODEL_ID_GEN_ONOFF_CLIENT,
            &mut comp.onoff_client as *mut _ as *mut core::ffi::c_void,
        );
        vendor_model(
            &mut comp.vendor_models[0],
            WIFI_CONFIG_MODEL_ID,
            comp.wifi_ops.as_mut_ptr(),
        );
        vendor_model(
            &mut comp.vendor_models[1],
            MQTT_CONFIG_MODEL_ID,
            comp.mqtt_ops.as_mut_ptr(),
        );

        let element = &mut comp.elements[0];
        element.location = 0;
        element.sig_model_count = comp.root_models.len() as u8;
        element.vnd_model_count = comp.vendor_models.len() as u8;
        element.sig_models = comp.root_models.as_mut_ptr();
        element.vnd_models = comp.vendor_models.as_mut_ptr();

        comp.comp.cid = CID_ESP;
        comp.comp.element_count = comp.elements.len() as _;
        comp.comp.elements = comp.elements.as_mut_ptr();
        comp.prov.uuid = comp.uuid.as_ptr();

        comp
    }
}

fn transmit(count: u8, interval_ms: u8) -> u8 {
    (count & 0x07) | (((interval_ms / 10) - 1) << 3)
}

fn vendor_op(opcode: u32) -> sys::esp_ble_mesh_model_op_t {
    sys::esp_ble_mesh_model_op_t {
        opcode,
        min_len: VENDOR_OP_MIN_LEN as _,
        param_cb: 0,
    }
}

fn sig_model(model: &mut sys::esp_ble_mesh_model_t, id: u16, user_data: *mut core::ffi::c_void) {
    model.__bindgen_anon_1.model_id = id;
    model.keys.fill(KEY_UNUSED);
    model.user_data = user_data;
}

fn vendor_model(
    model: &mut sys::esp_ble_mesh_model_t,
    id: u16,
    ops: *mut sys::esp_ble_mesh_model_op_t,
) {
    model.__bindgen_anon_1.vnd = sys::esp_ble_mesh_model__bindgen_ty_1__bindgen_ty_1 {
        company_id: CID_ESP,
        model_id: id,
    };
    model.keys.fill(KEY_UNUSED);
    model.op = ops;
}

/// Provisioned-node half of the mesh stack
pub struct EspMeshNode {
    // Controller and Bluedroid stay enabled while the node lives
    _bt: BtDriver<'static, Ble>,
}

impl EspMeshNode {
    /// Register callbacks, initialize the mesh stack and enable provisioning
    /// over both bearers.
    pub fn start(bt: BtDriver<'static, Ble>, device_name: &str) -> Result<Self, EspError> {
        info!("🕸️ Starting BLE mesh node '{}'", device_name);

        // SAFETY: the callbacks are plain extern "C" functions with 'static lifetime
        unsafe {
            esp!(sys::esp_ble_mesh_register_prov_callback(Some(prov_cb)))?;
            esp!(sys::esp_ble_mesh_register_custom_model_callback(Some(custom_model_cb)))?;
            esp!(sys::esp_ble_mesh_register_generic_client_callback(Some(generic_client_cb)))?;
        }

        let comp = Composition::leak();
        // SAFETY: the leaked tables outlive the mesh stack
        esp!(unsafe { sys::esp_ble_mesh_init(&mut comp.prov, &mut comp.comp) })?;

        let name = CString::new(device_name).unwrap_or_default();
        esp!(unsafe { sys::esp_ble_mesh_set_unprovisioned_device_name(name.as_ptr()) })?;

        esp!(unsafe {
            sys::esp_ble_mesh_node_prov_enable(
                sys::esp_ble_mesh_prov_bearer_t_ESP_BLE_MESH_PROV_ADV
                    | sys::esp_ble_mesh_prov_bearer_t_ESP_BLE_MESH_PROV_GATT,
            )
        })?;

        info!("✅ BLE mesh node initialized, waiting for provisioning");
        Ok(Self { _bt: bt })
    }
}

/// Sends vendor status replies through the model that received the request
#[derive(Debug, Default, Clone, Copy)]
pub struct EspMeshLink;

impl MeshLink for EspMeshLink {
    fn send_vendor_status(
        &self,
        ctx: &MessageContext,
        opcode: u32,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        if ctx.model == 0 {
            return Err(LinkError::Failed("no reply model in context".to_string()));
        }

        // SAFETY: zero is the expected initial value for the C context struct
        let mut msg_ctx: sys::esp_ble_mesh_msg_ctx_t = unsafe { core::mem::zeroed() };
        msg_ctx.net_idx = ctx.net_idx;
        msg_ctx.app_idx = ctx.app_idx;
        msg_ctx.addr = ctx.src;
        msg_ctx.recv_dst = ctx.dst;
        msg_ctx.send_ttl = SEND_TTL_DEFAULT;

        let model = ctx.model as *mut sys::esp_ble_mesh_model_t;
        let mut data = payload.to_vec();

        // SAFETY: `model` points into the leaked composition tables
        esp!(unsafe {
            sys::esp_ble_mesh_server_model_send_msg(
                model,
                &mut msg_ctx,
                opcode,
                data.len() as u16,
                data.as_mut_ptr(),
            )
        })
        .map_err(|e| LinkError::Failed(format!("{:?}", e)))
    }
}

extern "C" fn custom_model_cb(
    event: sys::esp_ble_mesh_model_cb_event_t,
    param: *mut sys::esp_ble_mesh_model_cb_param_t,
) {
    // Panics must not unwind into the mesh stack
    if let Err(panic) = std::panic::catch_unwind(|| custom_model_cb_impl(event, param)) {
        error!("🚨 PANIC in mesh model callback: {:?}", panic);
    }
}

fn custom_model_cb_impl(
    event: sys::esp_ble_mesh_model_cb_event_t,
    param: *mut sys::esp_ble_mesh_model_cb_param_t,
) {
    if param.is_null() {
        return;
    }

    match event {
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_MODEL_OPERATION_EVT => {
            // SAFETY: the stack passes a valid param for the duration of the call
            let op = unsafe { &(*param).model_operation };
            if op.ctx.is_null() {
                return;
            }
            let raw_ctx = unsafe { &*op.ctx };

            let payload = if op.msg.is_null() || op.length == 0 {
                Vec::new()
            } else {
                unsafe { std::slice::from_raw_parts(op.msg, op.length as usize) }.to_vec()
            };

            dispatch(MeshEvent::VendorMessage {
                ctx: MessageContext {
                    src: raw_ctx.addr,
                    dst: raw_ctx.recv_dst,
                    net_idx: raw_ctx.net_idx,
                    app_idx: raw_ctx.app_idx,
                    model: op.model as usize,
                },
                opcode: op.opcode,
                payload,
            });
        }
        sys::esp_ble_mesh_model_cb_event_t_ESP_BLE_MESH_MODEL_SEND_COMP_EVT => {
            let send = unsafe { &(*param).model_send_comp };
            if send.err_code != 0 {
                warn!("⚠️ Vendor status 0x{:06x} not sent: {}", send.opcode, send.err_code);
            }
        }
        other => debug!("Mesh model event {}", other),
    }
}

extern "C" fn prov_cb(
    event: sys::esp_ble_mesh_prov_cb_event_t,
    param: *mut sys::esp_ble_mesh_prov_cb_param_t,
) {
    if let Err(panic) = std::panic::catch_unwind(|| prov_cb_impl(event, param)) {
        error!("🚨 PANIC in mesh provisioning callback: {:?}", panic);
    }
}

fn prov_cb_impl(event: sys::esp_ble_mesh_prov_cb_event_t, param: *mut sys::esp_ble_mesh_prov_cb_param_t) {
    if param.is_null() {
        return;
    }

    match event {
        sys::esp_ble_mesh_prov_cb_event_t_ESP_BLE_MESH_NODE_PROV_COMPLETE_EVT => {
            let complete = unsafe { &(*param).node_prov_complete };
            dispatch(MeshEvent::ProvisioningComplete {
                net_idx: complete.net_idx,
                addr: complete.addr,
            });
        }
        sys::esp_ble_mesh_prov_cb_event_t_ESP_BLE_MESH_NODE_PROV_LINK_OPEN_EVT => {
            info!("🔗 Provisioning link opened");
        }
        sys::esp_ble_mesh_prov_cb_event_t_ESP_BLE_MESH_NODE_PROV_LINK_CLOSE_EVT => {
            info!("🔗 Provisioning link closed");
        }
        sys::esp_ble_mesh_prov_cb_event_t_ESP_BLE_MESH_NODE_PROV_RESET_EVT => {
            warn!("⚠️ Node provisioning was reset");
        }
        other => debug!("Mesh provisioning event {}", other),
    }
}

extern "C" fn generic_client_cb(
    event: sys::esp_ble_mesh_generic_client_cb_event_t,
    param: *mut sys::esp_ble_mesh_generic_client_cb_param_t,
) {
    if let Err(panic) = std::panic::catch_unwind(|| generic_client_cb_impl(event, param)) {
        error!("🚨 PANIC in generic client callback: {:?}", panic);
    }
}

fn generic_client_cb_impl(
    event: sys::esp_ble_mesh_generic_client_cb_event_t,
    param: *mut sys::esp_ble_mesh_generic_client_cb_param_t,
) {
    if param.is_null() {
        return;
    }

    match event {
        sys::esp_ble_mesh_generic_client_cb_event_t_ESP_BLE_MESH_GENERIC_CLIENT_PUBLISH_EVT => {
            let param = unsafe { &*param };
            if param.params.is_null() {
                return;
            }
            let addr = unsafe { (*param.params).ctx.addr };
            let on = unsafe { param.status_cb.onoff_status.present_onoff } != 0;
            dispatch(MeshEvent::OnOffStatus { addr, on });
        }
        sys::esp_ble_mesh_generic_client_cb_event_t_ESP_BLE_MESH_GENERIC_CLIENT_TIMEOUT_EVT => {
            debug!("Generic client request timed out");
        }
        other => debug!("Generic client event {}", other),
    }
}
