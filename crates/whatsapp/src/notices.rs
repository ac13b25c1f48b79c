//! Fixed replies sent without consulting the agent.

pub const MEDIA_NOT_SUPPORTED: &str =
    "Disculpa, actualmente solo puedo procesar mensajes de texto. Por favor escribe tu consulta. 📝";

pub const EMPTY_MESSAGE: &str = "No recibí ningún mensaje. Por favor escribe tu consulta. 😊";

pub const GENERIC: &str =
    "Lo siento, ha ocurrido un error temporal. Por favor, intenta de nuevo en unos momentos. 🙏";

pub const TECHNICAL_ERROR: &str = "Disculpa, he tenido un problema técnico temporal. 😔\n\n\
     Por favor intenta de nuevo en unos momentos.\n\n\
     ¡Gracias por tu paciencia!";

/// Sent when the agent outlives its time budget.
pub const SLOW_PROCESSING: &str = "Estoy revisando tu mensaje y tardé más de lo normal 🙏\n\n\
     ¿Puedes enviarlo de nuevo en unos segundos?";

/// Answer to a redelivered message whose first delivery never produced a reply.
pub const STILL_PROCESSING: &str = "Ya recibí tu mensaje y lo estoy procesando. 🙏";
