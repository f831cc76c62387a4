/*!
Brasero DevKit - Outils de développement pour l'écosystème Brasero

Permet de développer dashboards et intégrations sans broker MQTT ni kernel
qui tourne :
- MockMqttClient : client MQTT simulé avec enregistrement des publications
- builders : payloads versionnés conformes aux topics brasero/...@v1
- harness : assertions sur les messages échangés pendant un test
*/

pub mod builders;
pub mod harness;
pub mod mqtt_stub;

/// Topics versionnés du bus Brasero (dupliqués ici : le devkit ne dépend pas
/// du kernel, c'est le contrat de topic qui fait foi).
pub mod topics {
    pub const REGISTER: &str = "brasero/devices/register@v1";
    pub const ALERTS: &str = "brasero/alerts/transition@v1";
    pub const HISTORY: &str = "brasero/history/reading@v1";
}
