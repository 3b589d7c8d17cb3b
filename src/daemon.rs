use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use pylonbms_lib::protocol::{
    AlarmInfo, AlarmStatus, AnalogValues, FaultStatus, ProtectionStatus, SystemStatus,
};
use pylonbms_lib::serialport::PylonBMS;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

use crate::{commandline, mqtt};

// Well-known sensor positions on 16-cell packs; indices past the table get
// a generic name.
const TEMPERATURE_KEYS: [&str; 6] = [
    "CellTemp1_4",
    "CellTemp5_8",
    "CellTemp9_12",
    "CellTemp13_16",
    "MOS_T",
    "ENV_T",
];

fn temperature_key(index: usize) -> String {
    TEMPERATURE_KEYS
        .get(index)
        .map(|key| (*key).to_string())
        .unwrap_or_else(|| format!("Temp{index}"))
}

/// Everything the poll loop remembers between cycles. One pack is serviced
/// per cycle, round-robin.
struct PollState {
    pack_count: usize,
    current_pack: usize,
    info_published: Vec<bool>,
    discovery_published: Vec<bool>,
    versions: Vec<String>,
    barcodes: Vec<String>,
}

impl PollState {
    fn sized(pack_count: u8) -> Self {
        let n = usize::from(pack_count);
        Self {
            pack_count: n,
            current_pack: 0,
            info_published: vec![false; n],
            discovery_published: vec![false; n],
            versions: vec![String::new(); n],
            barcodes: vec![String::new(); n],
        }
    }

    fn advance(&mut self) {
        if self.pack_count > 0 {
            self.current_pack = (self.current_pack + 1) % self.pack_count;
        }
    }
}

fn protection_json(p: &ProtectionStatus) -> Value {
    json!({
        "Charger_OVP": p.charger_ovp,
        "SCP": p.short_circuit,
        "DSG_OCP": p.discharge_ocp,
        "CHG_OCP": p.charge_ocp,
        "Pack_UVP": p.pack_uvp,
        "Pack_OVP": p.pack_ovp,
        "Cell_UVP": p.cell_uvp,
        "Cell_OVP": p.cell_ovp,
        "ENV_UTP": p.env_utp,
        "ENV_OTP": p.env_otp,
        "MOS_OTP": p.mos_otp,
        "DSG_UTP": p.discharge_utp,
        "CHG_UTP": p.charge_utp,
        "DSG_OTP": p.discharge_otp,
        "CHG_OTP": p.charge_otp,
    })
}

fn system_json(s: &SystemStatus) -> Value {
    json!({
        "Fully_Charged": s.fully_charged,
        "Heater": s.heater,
        "AC_in": s.ac_in,
        "Discharge_MOS": s.discharge_mos,
        "Charge_MOS": s.charge_mos,
        "Charge_Limit": s.charge_limit,
    })
}

fn fault_json(f: &FaultStatus) -> Value {
    json!({
        "Heater_Fault": f.heater_fault,
        "CCB_Fault": f.ccb_fault,
        "Sampling_Fault": f.sampling_fault,
        "Cell_Fault": f.cell_fault,
        "NTC_Fault": f.ntc_fault,
        "DSG_MOS_Fault": f.discharge_mos_fault,
        "CHG_MOS_Fault": f.charge_mos_fault,
    })
}

fn alarm_json(a: &AlarmStatus) -> Value {
    json!({
        "DSG_OC": a.discharge_oc,
        "CHG_OC": a.charge_oc,
        "Pack_UV": a.pack_uv,
        "Pack_OV": a.pack_ov,
        "Cell_UV": a.cell_uv,
        "Cell_OV": a.cell_ov,
        "SOC_Low": a.soc_low,
        "MOS_OT": a.mos_ot,
        "ENV_UT": a.env_ut,
        "ENV_OT": a.env_ot,
        "DSG_UT": a.discharge_ut,
        "CHG_UT": a.charge_ut,
        "DSG_OT": a.discharge_ot,
        "CHG_OT": a.charge_ot,
    })
}

fn encode_pack_info(version: &str, barcode: &str) -> Value {
    json!({
        "Version": version,
        "BarCode": barcode,
    })
}

/// Builds the readings document published for one pack. `State` fields and
/// the status objects appear only when alarm info was polled.
fn encode_readings(analog: &AnalogValues, alarms: Option<&AlarmInfo>) -> Value {
    let mut root = Map::new();

    let mut cells = Map::new();
    for (i, reading) in analog.cell_voltages.iter().enumerate() {
        let mut cell = Map::new();
        cell.insert("Reading".into(), json!(*reading));
        if let Some(ai) = alarms {
            if let Some(state) = ai.cell_states.get(i) {
                cell.insert("State".into(), json!(*state));
            }
        }
        cells.insert(format!("Cell_{}", i + 1), Value::Object(cell));
    }
    root.insert("Cells".into(), Value::Object(cells));

    let mut temperatures = Map::new();
    for (i, reading) in analog.temperatures.iter().enumerate() {
        let mut temperature = Map::new();
        temperature.insert("Reading".into(), json!(*reading));
        if let Some(ai) = alarms {
            if let Some(state) = ai.temperature_states.get(i) {
                temperature.insert("State".into(), json!(*state));
            }
        }
        temperatures.insert(temperature_key(i), Value::Object(temperature));
    }
    root.insert("Temps".into(), Value::Object(temperatures));

    let mut current = Map::new();
    current.insert("Reading".into(), json!(analog.current));
    if let Some(ai) = alarms {
        current.insert("State".into(), json!(ai.current_state));
    }
    root.insert("PackCurrent".into(), Value::Object(current));

    let mut voltage = Map::new();
    voltage.insert("Reading".into(), json!(analog.voltage));
    if let Some(ai) = alarms {
        voltage.insert("State".into(), json!(ai.voltage_state));
    }
    root.insert("PackVoltage".into(), Value::Object(voltage));

    root.insert(
        "RemainingCapacity".into(),
        json!(analog.remaining_capacity),
    );
    root.insert("FullCapacity".into(), json!(analog.total_capacity));
    root.insert("CycleCount".into(), json!(analog.cycle_count));
    root.insert("SOC".into(), json!(analog.state_of_charge));
    root.insert("Power".into(), json!(analog.power));

    if let Some(ai) = alarms {
        root.insert("Protect_Status".into(), protection_json(&ai.protection));
        root.insert("System_Status".into(), system_json(&ai.system));
        root.insert("Fault_Status".into(), fault_json(&ai.fault));
        root.insert("Alarm_Status".into(), alarm_json(&ai.alarm));
    }

    Value::Object(root)
}

#[allow(clippy::too_many_arguments)]
fn discovery_doc(
    config: &mqtt::MqttConfig,
    pack_number: usize,
    version: &str,
    barcode: &str,
    entity: &str,
    json_element: &str,
    device_class: Option<&str>,
    unit: &str,
    icon: Option<&str>,
) -> (String, Value) {
    let object_id = format!("Pylon_Pack{pack_number}_{entity}");
    let mut doc = Map::new();
    if let Some(device_class) = device_class {
        doc.insert("device_class".into(), json!(device_class));
    }
    doc.insert("unit_of_measurement".into(), json!(unit));
    doc.insert("state_class".into(), json!("measurement"));
    doc.insert("name".into(), json!(entity));
    if let Some(icon) = icon {
        doc.insert("icon".into(), json!(icon));
    }
    doc.insert(
        "state_topic".into(),
        json!(config.stat_topic(&format!("readings/Pack{pack_number}"))),
    );
    doc.insert("unique_id".into(), json!(object_id));
    doc.insert(
        "value_template".into(),
        json!(format!("{{{{ value_json.{json_element} }}}}")),
    );
    doc.insert("availability_topic".into(), json!(config.lwt_topic()));
    doc.insert("pl_avail".into(), json!("Online"));
    doc.insert("pl_not_avail".into(), json!("Offline"));
    doc.insert(
        "device".into(),
        json!({
            "name": format!("Pack{pack_number}"),
            "via_device": config.via_device(),
            "hw_version": barcode,
            "sw_version": env!("CARGO_PKG_VERSION"),
            "manufacturer": "ClassicDIY",
            "model": version,
            "identifiers": format!("Pack{pack_number}_{barcode}"),
        }),
    );
    (config.discovery_topic(&object_id), Value::Object(doc))
}

fn publish_discovery(
    publisher: &mut mqtt::MqttPublisher,
    pack_number: usize,
    version: &str,
    barcode: &str,
    analog: &AnalogValues,
) -> Result<()> {
    info!("Publishing discovery for Pack{pack_number}");
    let config = publisher.config().clone();

    let mut entities = vec![
        discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            "PackVoltage",
            "PackVoltage.Reading",
            Some("voltage"),
            "V",
            Some("mdi:lightning-bolt"),
        ),
        discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            "PackCurrent",
            "PackCurrent.Reading",
            Some("current"),
            "A",
            Some("mdi:current-dc"),
        ),
        discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            "SOC",
            "SOC",
            Some("battery"),
            "%",
            None,
        ),
        discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            "RemainingCapacity",
            "RemainingCapacity",
            None,
            "Ah",
            Some("mdi:ev-station"),
        ),
    ];

    for i in 0..analog.cell_voltages.len() {
        let entity = format!("Cell_{}", i + 1);
        let element = format!("Cells.Cell_{}.Reading", i + 1);
        entities.push(discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            &entity,
            &element,
            Some("voltage"),
            "V",
            Some("mdi:lightning-bolt"),
        ));
    }

    for i in 0..analog.temperatures.len() {
        let key = temperature_key(i);
        let element = format!("Temps.{key}.Reading");
        entities.push(discovery_doc(
            &config,
            pack_number,
            version,
            barcode,
            &key,
            &element,
            Some("temperature"),
            "°C",
            None,
        ));
    }

    for (topic, doc) in entities {
        publisher.publish(&topic, &doc.to_string(), false)?;
    }
    Ok(())
}

enum Sink {
    Console,
    Mqtt(mqtt::MqttPublisher),
}

impl Sink {
    fn publish_readings(&mut self, pack_number: usize, readings: &Value) -> Result<()> {
        match self {
            Sink::Console => {
                println!(
                    "--- Pack{} at {} ---",
                    pack_number,
                    chrono::Local::now().to_rfc3339()
                );
                println!("{readings}");
                Ok(())
            }
            Sink::Mqtt(publisher) => {
                let topic = publisher
                    .config()
                    .stat_topic(&format!("readings/Pack{pack_number}"));
                publisher.publish(&topic, &readings.to_string(), false)
            }
        }
    }

    fn publish_info(&mut self, pack_number: usize, pack_info: &Value) -> Result<()> {
        match self {
            Sink::Console => {
                println!("Pack{pack_number} info: {pack_info}");
                Ok(())
            }
            Sink::Mqtt(publisher) => {
                let topic = publisher
                    .config()
                    .stat_topic(&format!("info/Pack{pack_number}"));
                // retained so consumers see pack identity without waiting a
                // full info cycle
                publisher.publish(&topic, &pack_info.to_string(), true)
            }
        }
    }
}

fn service_pack(
    bms: &mut PylonBMS,
    state: &mut PollState,
    sink: &mut Sink,
    pack_number: usize,
    include_alarms: bool,
) -> Result<()> {
    let index = pack_number - 1;
    let pack = pack_number as u8;

    if !state.info_published[index] {
        let version = bms
            .get_version_info(pack)
            .with_context(|| format!("Cannot get version info of pack {pack_number}"))?;
        info!("Pack{pack_number} version: {}", version.version);
        let barcode = bms
            .get_barcode(pack)
            .with_context(|| format!("Cannot get barcode of pack {pack_number}"))?;
        info!("Pack{pack_number} barcode: {}", barcode.barcode);
        sink.publish_info(
            pack_number,
            &encode_pack_info(&version.version, &barcode.barcode),
        )?;
        state.versions[index] = version.version;
        state.barcodes[index] = barcode.barcode;
        state.info_published[index] = true;
    }

    let analog = bms
        .get_analog_values(pack)
        .with_context(|| format!("Cannot get analog values of pack {pack_number}"))?;
    debug!("Pack{pack_number} analog values: {analog:?}");

    let alarms = if include_alarms {
        let alarm_info = bms
            .get_alarm_info(pack)
            .with_context(|| format!("Cannot get alarm info of pack {pack_number}"))?;
        debug!("Pack{pack_number} alarm info: {alarm_info:?}");
        Some(alarm_info)
    } else {
        None
    };

    sink.publish_readings(pack_number, &encode_readings(&analog, alarms.as_ref()))?;

    if !state.discovery_published[index] {
        if let Sink::Mqtt(publisher) = sink {
            publish_discovery(
                publisher,
                pack_number,
                &state.versions[index],
                &state.barcodes[index],
                &analog,
            )?;
        }
        state.discovery_published[index] = true;
    }
    Ok(())
}

fn poll_cycle(
    bms: &mut PylonBMS,
    state: &mut Option<PollState>,
    sink: &mut Sink,
    include_alarms: bool,
) -> Result<()> {
    let state = match state {
        Some(state) => state,
        None => {
            // first cycle only sizes the rack, like the reference tool
            let packs = bms.get_pack_count().context("Cannot get pack count")?;
            info!("Pack count: {}", packs.count);
            if packs.count == 0 {
                warn!("No packs reported on the bus");
            }
            *state = Some(PollState::sized(packs.count));
            return Ok(());
        }
    };

    if state.pack_count == 0 {
        return Ok(());
    }

    let pack_number = state.current_pack + 1; // pack number is origin 1
    let result = service_pack(bms, state, sink, pack_number, include_alarms);
    state.advance(); // move on to the next pack even after a failure
    result
}

pub fn run(
    mut bms: PylonBMS,
    output: commandline::DaemonOutput,
    interval: Duration,
    include_alarms: bool,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, include_alarms={include_alarms}"
    );

    let mut sink = match &output {
        commandline::DaemonOutput::Console => Sink::Console,
        commandline::DaemonOutput::Mqtt { config_file } => {
            let config = mqtt::MqttConfig::load(config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Sink::Mqtt(publisher)
        }
    };

    let mut state: Option<PollState> = None;
    // explicit schedule with a computed next deadline; an overrun shifts
    // the schedule instead of stacking missed cycles
    let mut next_deadline = Instant::now() + interval;
    loop {
        if let Err(err) = poll_cycle(&mut bms, &mut state, &mut sink, include_alarms) {
            error!("Poll cycle failed: {err:#}");
        }
        let now = Instant::now();
        if next_deadline < now {
            next_deadline = now;
        }
        std::thread::sleep(next_deadline - now);
        next_deadline += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_analog() -> AnalogValues {
        AnalogValues {
            module: 1,
            cell_voltages: vec![1.234, 3.5],
            temperatures: vec![27.0, 25.0],
            current: -1.5,
            voltage: 49.34,
            power: -74.0,
            remaining_capacity: 80.0,
            total_capacity: 100.0,
            cycle_count: 5,
            state_of_charge: 0.8,
        }
    }

    fn sample_alarms() -> AlarmInfo {
        AlarmInfo {
            module: 1,
            cell_states: vec![0, 1],
            temperature_states: vec![0, 2],
            current_state: 0,
            voltage_state: 1,
            protection: ProtectionStatus::from_bytes(0b1000_0001, 0b1000_0000),
            system: SystemStatus::from_bytes(0b0000_0110, 0b1000_0000),
            fault: FaultStatus::from_byte(0),
            alarm: AlarmStatus::from_bytes(0b0010_0000, 0b1000_0000),
        }
    }

    #[test]
    fn readings_with_alarms_carry_states_and_status_objects() {
        let readings = encode_readings(&sample_analog(), Some(&sample_alarms()));
        assert_eq!(readings["Cells"]["Cell_1"]["Reading"], json!(1.234f32));
        assert_eq!(readings["Cells"]["Cell_2"]["State"], json!(1));
        assert_eq!(readings["Temps"]["CellTemp1_4"]["Reading"], json!(27.0f32));
        assert_eq!(readings["Temps"]["CellTemp5_8"]["State"], json!(2));
        assert_eq!(readings["PackCurrent"]["Reading"], json!(-1.5f32));
        assert_eq!(readings["PackCurrent"]["State"], json!(0));
        assert_eq!(readings["PackVoltage"]["State"], json!(1));
        assert_eq!(readings["RemainingCapacity"], json!(80.0f32));
        assert_eq!(readings["FullCapacity"], json!(100.0f32));
        assert_eq!(readings["CycleCount"], json!(5));
        assert_eq!(readings["SOC"], json!(0.8f32));
        assert_eq!(readings["Power"], json!(-74.0f32));
        assert_eq!(readings["Protect_Status"]["Charger_OVP"], json!(true));
        assert_eq!(readings["Protect_Status"]["SCP"], json!(false));
        assert_eq!(readings["System_Status"]["Fully_Charged"], json!(true));
        assert_eq!(readings["System_Status"]["Charge_MOS"], json!(true));
        assert_eq!(readings["Fault_Status"]["NTC_Fault"], json!(false));
        assert_eq!(readings["Alarm_Status"]["DSG_OC"], json!(true));
        assert_eq!(readings["Alarm_Status"]["SOC_Low"], json!(true));
    }

    #[test]
    fn readings_without_alarms_omit_states_and_status_objects() {
        let readings = encode_readings(&sample_analog(), None);
        assert!(readings["Cells"]["Cell_1"].get("State").is_none());
        assert!(readings["PackCurrent"].get("State").is_none());
        assert!(readings.get("Protect_Status").is_none());
        assert!(readings.get("System_Status").is_none());
        assert!(readings.get("Fault_Status").is_none());
        assert!(readings.get("Alarm_Status").is_none());
        assert_eq!(readings["SOC"], json!(0.8f32));
    }

    #[test]
    fn temperature_names_fall_back_past_the_table() {
        assert_eq!(temperature_key(0), "CellTemp1_4");
        assert_eq!(temperature_key(4), "MOS_T");
        assert_eq!(temperature_key(5), "ENV_T");
        assert_eq!(temperature_key(6), "Temp6");
    }

    #[test]
    fn pack_info_document() {
        let doc = encode_pack_info("V1.3", "PPTAH0213220371");
        assert_eq!(doc["Version"], json!("V1.3"));
        assert_eq!(doc["BarCode"], json!("PPTAH0213220371"));
    }

    #[test]
    fn discovery_document_shape() {
        let config: mqtt::MqttConfig = serde_yaml::from_str("host: broker.local").unwrap();
        let (topic, doc) = discovery_doc(
            &config,
            2,
            "V1.3",
            "PPTAH0213220371",
            "PackVoltage",
            "PackVoltage.Reading",
            Some("voltage"),
            "V",
            Some("mdi:lightning-bolt"),
        );
        assert_eq!(topic, "homeassistant/sensor/Pylon_Pack2_PackVoltage/config");
        assert_eq!(doc["device_class"], json!("voltage"));
        assert_eq!(doc["state_class"], json!("measurement"));
        assert_eq!(
            doc["state_topic"],
            json!("PylonToMQTT/Main/stat/readings/Pack2")
        );
        assert_eq!(
            doc["value_template"],
            json!("{{ value_json.PackVoltage.Reading }}")
        );
        assert_eq!(doc["availability_topic"], json!("PylonToMQTT/Main/tele/LWT"));
        assert_eq!(doc["device"]["hw_version"], json!("PPTAH0213220371"));
        assert_eq!(doc["device"]["model"], json!("V1.3"));
        assert_eq!(doc["device"]["via_device"], json!("PylonToMQTT"));
        assert_eq!(
            doc["device"]["identifiers"],
            json!("Pack2_PPTAH0213220371")
        );
    }

    #[test]
    fn poll_state_round_robin() {
        let mut state = PollState::sized(3);
        assert_eq!(state.current_pack, 0);
        state.advance();
        state.advance();
        assert_eq!(state.current_pack, 2);
        state.advance();
        assert_eq!(state.current_pack, 0);

        // zero packs must not divide by zero
        let mut empty = PollState::sized(0);
        empty.advance();
        assert_eq!(empty.current_pack, 0);
    }
}
